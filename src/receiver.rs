use crate::message::{TransferMessage, TransferRequest, TransferResponse};
use crate::{ChannelId, Error, Events, PauseableTransport, Transport};
use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;

/// Protocol name for transfer messages sent outside the block transport.
pub static PROTOCOL_DATA_TRANSFER: &str = "/fil/datatransfer/1.0.0";

/// Boundary to the peer-to-peer messaging link carrying out-of-band transfer
/// messages. Sending may block on I/O.
#[async_trait]
pub trait DataTransferNetwork: Send + Sync {
    async fn send_message(&self, peer: &PeerId, message: TransferMessage) -> Result<(), Error>;
}

/// Dispatches transfer messages arriving over the side channel into the same
/// event stream the block-transport hooks feed, and acts on the pause and
/// resume directives the handler returns.
pub struct Receiver {
    peer_id: PeerId,
    events: Arc<dyn Events>,
    transport: Arc<dyn Transport>,
    network: Arc<dyn DataTransferNetwork>,
}

impl Receiver {
    pub fn new(
        peer_id: PeerId,
        events: Arc<dyn Events>,
        transport: Arc<dyn Transport>,
        network: Arc<dyn DataTransferNetwork>,
    ) -> Self {
        Self {
            peer_id,
            events,
            transport,
            network,
        }
    }

    pub async fn receive_request(&self, initiator: PeerId, request: TransferRequest) {
        if let Err(e) = self.handle_request(initiator, request).await {
            log::error!("failed to process transfer request: {}", e);
        }
    }

    async fn handle_request(&self, initiator: PeerId, request: TransferRequest) -> Result<(), Error> {
        let chid = ChannelId {
            initiator: initiator.clone(),
            responder: self.peer_id.clone(),
            id: request.transfer_id,
        };
        let (response, result) = self.events.on_request_received(&chid, &request);
        match result {
            Err(Error::Resume) => {
                let msg = response.map(|response| TransferMessage {
                    is_rq: false,
                    request: None,
                    response: Some(response),
                });
                self.pauseable()?.resume_channel(msg, &chid).await
            }
            result => {
                if let Some(response) = response {
                    if response.accepted && !response.is_update() && !request.is_pull() {
                        // accepted push: this peer opens the block-transport
                        // request back to the initiator, response attached
                        let root = request.root.to_cid().ok_or_else(|| {
                            Error::Encoding("invalid payload cid".to_string())
                        })?;
                        let msg = TransferMessage {
                            is_rq: false,
                            request: None,
                            response: Some(response),
                        };
                        self.transport.open_channel(
                            initiator.clone(),
                            chid.clone(),
                            root,
                            request.selector.clone(),
                            msg,
                        )?;
                    } else {
                        let msg = TransferMessage {
                            is_rq: false,
                            request: None,
                            response: Some(response),
                        };
                        self.network.send_message(&initiator, msg).await?;
                    }
                }
                match result {
                    Ok(()) => Ok(()),
                    Err(Error::Pause) => self.pauseable()?.pause_channel(&chid).await,
                    Err(err) => {
                        let _ = self.transport.close_channel(&chid).await;
                        Err(err)
                    }
                }
            }
        }
    }

    pub async fn receive_response(&self, sender: PeerId, response: TransferResponse) {
        if let Err(e) = self.handle_response(sender, response).await {
            log::error!("failed to process transfer response: {}", e);
        }
    }

    async fn handle_response(&self, sender: PeerId, response: TransferResponse) -> Result<(), Error> {
        let chid = ChannelId {
            initiator: self.peer_id.clone(),
            responder: sender,
            id: response.transfer_id,
        };
        match self.events.on_response_received(&chid, &response) {
            Ok(()) => Ok(()),
            Err(Error::Resume) => self.pauseable()?.resume_channel(None, &chid).await,
            Err(Error::Pause) => self.pauseable()?.pause_channel(&chid).await,
            Err(err) => {
                let _ = self.transport.close_channel(&chid).await;
                Err(err)
            }
        }
    }

    pub fn receive_error(&self, err: Error) {
        log::error!("received error message on data transfer: {}", err);
    }

    fn pauseable(&self) -> Result<&dyn PauseableTransport, Error> {
        self.transport.pauseable().ok_or(Error::Unpauseable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CidCbor;
    use crate::selector::{RecursionLimit, Selector};
    use libipld::Cid;
    use std::sync::Mutex;

    fn root() -> Cid {
        Cid::try_from("bafy2bzaceafciokjlt5v5l53pftj6zcmulc2huy3fduwyqsm3zo5bzkau7muq").unwrap()
    }

    fn explore_all() -> Selector {
        Selector::ExploreRecursive {
            limit: RecursionLimit::None,
            sequence: Box::new(Selector::ExploreAll {
                next: Box::new(Selector::ExploreRecursiveEdge),
            }),
        }
    }

    fn push_request(transfer_id: u64) -> TransferRequest {
        TransferRequest {
            root: CidCbor::from(root()),
            pull: false,
            transfer_id,
            ..Default::default()
        }
    }

    fn pull_request(transfer_id: u64) -> TransferRequest {
        TransferRequest {
            root: CidCbor::from(root()),
            pull: true,
            transfer_id,
            ..Default::default()
        }
    }

    fn accepted(transfer_id: u64) -> TransferResponse {
        TransferResponse {
            accepted: true,
            transfer_id,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        opened: Mutex<Vec<(PeerId, ChannelId, Cid, Selector, TransferMessage)>>,
        closed: Mutex<Vec<ChannelId>>,
        paused: Mutex<Vec<ChannelId>>,
        resumed: Mutex<Vec<(Option<TransferMessage>, ChannelId)>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn open_channel(
            &self,
            data_sender: PeerId,
            chid: ChannelId,
            root: Cid,
            selector: Selector,
            msg: TransferMessage,
        ) -> Result<(), Error> {
            self.opened
                .lock()
                .unwrap()
                .push((data_sender, chid, root, selector, msg));
            Ok(())
        }
        async fn close_channel(&self, chid: &ChannelId) -> Result<(), Error> {
            self.closed.lock().unwrap().push(chid.clone());
            Ok(())
        }
        fn set_event_handler(&self, _events: Arc<dyn Events>) -> Result<(), Error> {
            Ok(())
        }
        fn cleanup_channel(&self, _chid: &ChannelId) {}
        fn pauseable(&self) -> Option<&dyn PauseableTransport> {
            Some(self)
        }
    }

    #[async_trait]
    impl PauseableTransport for FakeTransport {
        async fn pause_channel(&self, chid: &ChannelId) -> Result<(), Error> {
            self.paused.lock().unwrap().push(chid.clone());
            Ok(())
        }
        async fn resume_channel(
            &self,
            msg: Option<TransferMessage>,
            chid: &ChannelId,
        ) -> Result<(), Error> {
            self.resumed.lock().unwrap().push((msg, chid.clone()));
            Ok(())
        }
    }

    /// Transport without pause support, for the degraded path.
    struct FixedTransport;

    #[async_trait]
    impl Transport for FixedTransport {
        fn open_channel(
            &self,
            _data_sender: PeerId,
            _chid: ChannelId,
            _root: Cid,
            _selector: Selector,
            _msg: TransferMessage,
        ) -> Result<(), Error> {
            Ok(())
        }
        async fn close_channel(&self, _chid: &ChannelId) -> Result<(), Error> {
            Ok(())
        }
        fn set_event_handler(&self, _events: Arc<dyn Events>) -> Result<(), Error> {
            Ok(())
        }
        fn cleanup_channel(&self, _chid: &ChannelId) {}
    }

    #[derive(Default)]
    struct FakeNetwork {
        sent: Mutex<Vec<(PeerId, TransferMessage)>>,
    }

    #[async_trait]
    impl DataTransferNetwork for FakeNetwork {
        async fn send_message(
            &self,
            peer: &PeerId,
            message: TransferMessage,
        ) -> Result<(), Error> {
            self.sent.lock().unwrap().push((peer.clone(), message));
            Ok(())
        }
    }

    #[derive(Default)]
    struct ReceiverEvents {
        requests: Mutex<Vec<(ChannelId, u64)>>,
        responses: Mutex<Vec<(ChannelId, u64)>>,
        request_reply: Mutex<Option<TransferResponse>>,
        request_error: Mutex<Option<Error>>,
        response_error: Mutex<Option<Error>>,
    }

    impl Events for ReceiverEvents {
        fn on_channel_opened(&self, _chid: &ChannelId) -> Result<(), Error> {
            Ok(())
        }
        fn on_data_received(
            &self,
            _chid: &ChannelId,
            _link: &Cid,
            _size: usize,
        ) -> Result<(), Error> {
            Ok(())
        }
        fn on_data_sent(
            &self,
            _chid: &ChannelId,
            _link: &Cid,
            _size: usize,
        ) -> (Option<TransferMessage>, Result<(), Error>) {
            (None, Ok(()))
        }
        fn on_request_received(
            &self,
            chid: &ChannelId,
            request: &TransferRequest,
        ) -> (Option<TransferResponse>, Result<(), Error>) {
            self.requests
                .lock()
                .unwrap()
                .push((chid.clone(), request.transfer_id));
            let reply = self.request_reply.lock().unwrap().take();
            let result = match self.request_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            (reply, result)
        }
        fn on_response_received(
            &self,
            chid: &ChannelId,
            response: &TransferResponse,
        ) -> Result<(), Error> {
            self.responses
                .lock()
                .unwrap()
                .push((chid.clone(), response.transfer_id));
            match self.response_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        fn on_channel_completed(&self, _chid: &ChannelId, _success: bool) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Harness {
        peer_id: PeerId,
        other: PeerId,
        events: Arc<ReceiverEvents>,
        transport: Arc<FakeTransport>,
        network: Arc<FakeNetwork>,
        receiver: Receiver,
    }

    impl Harness {
        fn new() -> Self {
            let peer_id = PeerId::random();
            let other = PeerId::random();
            let events = Arc::new(ReceiverEvents::default());
            let transport = Arc::new(FakeTransport::default());
            let network = Arc::new(FakeNetwork::default());
            let receiver = Receiver::new(
                peer_id.clone(),
                events.clone(),
                transport.clone(),
                network.clone(),
            );
            Self {
                peer_id,
                other,
                events,
                transport,
                network,
                receiver,
            }
        }

        fn remote_chid(&self, id: u64) -> ChannelId {
            ChannelId {
                initiator: self.other.clone(),
                responder: self.peer_id.clone(),
                id,
            }
        }

        fn local_chid(&self, id: u64) -> ChannelId {
            ChannelId {
                initiator: self.peer_id.clone(),
                responder: self.other.clone(),
                id,
            }
        }
    }

    #[async_std::test]
    async fn accepted_push_opens_block_transport_channel() {
        let h = Harness::new();
        *h.events.request_reply.lock().unwrap() = Some(accepted(7));

        h.receiver
            .receive_request(h.other.clone(), push_request(7))
            .await;

        let opened = h.transport.opened.lock().unwrap();
        assert_eq!(opened.len(), 1);
        let (data_sender, chid, cid, selector, msg) = &opened[0];
        assert_eq!(*data_sender, h.other);
        assert_eq!(*chid, h.remote_chid(7));
        assert_eq!(*cid, root());
        assert_eq!(*selector, explore_all());
        assert_eq!(msg.response, Some(accepted(7)));
        assert!(h.network.sent.lock().unwrap().is_empty());
        assert_eq!(
            *h.events.requests.lock().unwrap(),
            vec![(h.remote_chid(7), 7)]
        );
    }

    #[async_std::test]
    async fn pull_request_answered_over_side_channel() {
        let h = Harness::new();
        *h.events.request_reply.lock().unwrap() = Some(accepted(7));

        h.receiver
            .receive_request(h.other.clone(), pull_request(7))
            .await;

        assert!(h.transport.opened.lock().unwrap().is_empty());
        let sent = h.network.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, h.other);
        assert_eq!(sent[0].1.response, Some(accepted(7)));
    }

    #[async_std::test]
    async fn update_response_sent_over_side_channel() {
        let h = Harness::new();
        *h.events.request_reply.lock().unwrap() = Some(TransferResponse {
            update: true,
            ..accepted(7)
        });

        h.receiver
            .receive_request(h.other.clone(), push_request(7))
            .await;

        assert!(h.transport.opened.lock().unwrap().is_empty());
        assert_eq!(h.network.sent.lock().unwrap().len(), 1);
    }

    #[async_std::test]
    async fn rejected_request_closes_channel() {
        let h = Harness::new();
        *h.events.request_error.lock().unwrap() =
            Some(Error::Custom("voucher rejected".to_string()));

        let result = h
            .receiver
            .handle_request(h.other.clone(), pull_request(7))
            .await;
        assert_eq!(result, Err(Error::Custom("voucher rejected".to_string())));
        assert_eq!(*h.transport.closed.lock().unwrap(), vec![h.remote_chid(7)]);
    }

    #[async_std::test]
    async fn pause_directive_pauses_channel_after_reply() {
        let h = Harness::new();
        *h.events.request_reply.lock().unwrap() = Some(accepted(7));
        *h.events.request_error.lock().unwrap() = Some(Error::Pause);

        h.receiver
            .receive_request(h.other.clone(), pull_request(7))
            .await;

        assert_eq!(h.network.sent.lock().unwrap().len(), 1);
        assert_eq!(*h.transport.paused.lock().unwrap(), vec![h.remote_chid(7)]);
    }

    #[async_std::test]
    async fn resume_directive_carries_reply_to_transport() {
        let h = Harness::new();
        *h.events.request_reply.lock().unwrap() = Some(accepted(7));
        *h.events.request_error.lock().unwrap() = Some(Error::Resume);

        h.receiver
            .receive_request(h.other.clone(), push_request(7))
            .await;

        // the reply travels with the resume, not over the side channel
        assert!(h.network.sent.lock().unwrap().is_empty());
        assert!(h.transport.opened.lock().unwrap().is_empty());
        let resumed = h.transport.resumed.lock().unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].1, h.remote_chid(7));
        let msg = resumed[0].0.as_ref().unwrap();
        assert_eq!(msg.response, Some(accepted(7)));
    }

    #[async_std::test]
    async fn response_directives_drive_transport() {
        let h = Harness::new();

        *h.events.response_error.lock().unwrap() = Some(Error::Resume);
        h.receiver
            .receive_response(h.other.clone(), accepted(9))
            .await;
        assert_eq!(
            *h.transport.resumed.lock().unwrap(),
            vec![(None, h.local_chid(9))]
        );

        *h.events.response_error.lock().unwrap() = Some(Error::Pause);
        h.receiver
            .receive_response(h.other.clone(), accepted(9))
            .await;
        assert_eq!(*h.transport.paused.lock().unwrap(), vec![h.local_chid(9)]);

        *h.events.response_error.lock().unwrap() =
            Some(Error::Custom("went sideways".to_string()));
        let result = h
            .receiver
            .handle_response(h.other.clone(), accepted(9))
            .await;
        assert_eq!(result, Err(Error::Custom("went sideways".to_string())));
        assert_eq!(*h.transport.closed.lock().unwrap(), vec![h.local_chid(9)]);
    }

    #[async_std::test]
    async fn unpauseable_transport_degrades_with_error() {
        let h = Harness::new();
        *h.events.response_error.lock().unwrap() = Some(Error::Resume);
        let receiver = Receiver::new(
            h.peer_id.clone(),
            h.events.clone(),
            Arc::new(FixedTransport),
            h.network.clone(),
        );
        let result = receiver.handle_response(h.other.clone(), accepted(9)).await;
        assert_eq!(result, Err(Error::Unpauseable));
    }
}
