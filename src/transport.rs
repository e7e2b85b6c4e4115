use crate::encoding::Cbor;
use crate::graphsync::{
    BlockData, Extensions, GraphExchange, GraphsyncHooks, GraphsyncRequest, GraphsyncResponse,
    IncomingBlockActions, IncomingRequestActions, IncomingResponseActions, OutgoingBlockActions,
    RequestId, RequestUpdatedActions, ResponseStatusCode,
};
use crate::message::{TransferMessage, TransferResponse, EXTENSION_KEY};
use crate::selector::Selector;
use crate::{ChannelId, Error, Events, PauseableTransport, Transport, TransferId};
use async_std::channel::{bounded, Receiver as SignalReceiver, Sender as SignalSender};
use async_std::future::timeout;
use async_trait::async_trait;
use fnv::FnvHashMap;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use libipld::Cid;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[cfg(not(target_os = "unknown"))]
use async_std::task::spawn;

#[cfg(target_os = "unknown")]
use async_std::task::spawn_local as spawn;

/// Correlation key for one live block-transport request. Request ids are only
/// scoped to a peer, so the pair is what identifies the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphsyncKey {
    pub request_id: RequestId,
    pub peer: PeerId,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How long control calls wait for the block transport to acknowledge an
    /// outgoing request before giving up with [`Error::ChannelNotFound`].
    pub pending_channel_timeout: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self {
            pending_channel_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the channel for a transfer message exchanged between two peers.
/// The initiator is whoever sent the original transfer request: the message
/// sender for requests, the message receiver for responses.
fn message_channel(is_rq: bool, id: TransferId, sender: &PeerId, receiver: &PeerId) -> ChannelId {
    if is_rq {
        ChannelId {
            initiator: sender.clone(),
            responder: receiver.clone(),
            id,
        }
    } else {
        ChannelId {
            initiator: receiver.clone(),
            responder: sender.clone(),
            id,
        }
    }
}

/// Watermarks deduplicating outgoing block notifications when the block
/// transport walks the same DAG again after an unpause or restart.
#[derive(Debug, Default, Clone, Copy)]
struct ResponseProgress {
    current_sent: u64,
    maximum_sent: u64,
}

/// One-shot latch created on open and dropped by the outgoing request hook.
/// Waiters clone the receiver; recv fails once the sender is gone.
struct PendingSignal {
    _close: SignalSender<()>,
    wait: SignalReceiver<()>,
}

impl PendingSignal {
    fn new() -> Self {
        let (s, r) = bounded(1);
        Self { _close: s, wait: r }
    }
}

/// All per-channel bookkeeping, guarded by one RwLock. For every channel
/// either a pending signal exists and the reverse map entry is absent, or the
/// reverse entry is present and the signal has been dropped.
#[derive(Default)]
struct ChannelMap {
    channels: FnvHashMap<GraphsyncKey, ChannelId>,
    keys: HashMap<ChannelId, GraphsyncKey>,
    cancel: HashMap<ChannelId, oneshot::Sender<()>>,
    pending: HashMap<ChannelId, PendingSignal>,
    requestor_cancelled: HashSet<ChannelId>,
    pending_extensions: HashMap<ChannelId, Vec<(String, Vec<u8>)>>,
    progress: HashMap<ChannelId, ResponseProgress>,
}

impl ChannelMap {
    fn new_pending(&mut self, chid: ChannelId, cancel: oneshot::Sender<()>) {
        self.pending.insert(chid.clone(), PendingSignal::new());
        self.cancel.insert(chid, cancel);
    }

    fn close_pending(&mut self, chid: &ChannelId) {
        self.pending.remove(chid);
    }

    fn bind_outgoing(&mut self, chid: ChannelId, key: GraphsyncKey) {
        self.channels.insert(key.clone(), chid.clone());
        self.keys.insert(chid.clone(), key);
        self.close_pending(&chid);
    }

    fn bind_incoming(&mut self, chid: ChannelId, key: GraphsyncKey) {
        self.channels.insert(key.clone(), chid.clone());
        self.keys.insert(chid.clone(), key);
        let rp = self.progress.entry(chid).or_default();
        rp.current_sent = 0;
    }

    fn channel(&self, key: &GraphsyncKey) -> Option<ChannelId> {
        self.channels.get(key).cloned()
    }

    fn remove_channel(&mut self, chid: &ChannelId) {
        if let Some(key) = self.keys.remove(chid) {
            self.channels.remove(&key);
        }
        self.cancel.remove(chid);
        self.pending.remove(chid);
        self.progress.remove(chid);
        self.pending_extensions.remove(chid);
        self.requestor_cancelled.remove(chid);
    }
}

/// Transport adapter translating block-transport hooks into semantic
/// data-transfer events and control verbs back into hook actions. Clones
/// share state so hooks, detached tasks and API callers all see one map.
pub struct GraphsyncTransport<G> {
    peer_id: PeerId,
    config: Config,
    gs: Arc<G>,
    events: Arc<RwLock<Option<Arc<dyn Events>>>>,
    data: Arc<RwLock<ChannelMap>>,
}

impl<G> Clone for GraphsyncTransport<G> {
    fn clone(&self) -> Self {
        Self {
            peer_id: self.peer_id.clone(),
            config: self.config.clone(),
            gs: Arc::clone(&self.gs),
            events: Arc::clone(&self.events),
            data: Arc::clone(&self.data),
        }
    }
}

impl<G: GraphExchange + 'static> GraphsyncTransport<G> {
    pub fn new(peer_id: PeerId, gs: Arc<G>) -> Self {
        Self::with_config(peer_id, gs, Config::default())
    }

    pub fn with_config(peer_id: PeerId, gs: Arc<G>, config: Config) -> Self {
        Self {
            peer_id,
            config,
            gs,
            events: Arc::new(RwLock::new(None)),
            data: Arc::new(RwLock::new(ChannelMap::default())),
        }
    }

    fn events(&self) -> Result<Arc<dyn Events>, Error> {
        self.events.read().unwrap().clone().ok_or(Error::HandlerNotSet)
    }

    /// Waits until the channel is correlated with a block-transport request,
    /// the pending signal times out, or neither exists.
    async fn gs_key(&self, chid: &ChannelId) -> Result<GraphsyncKey, Error> {
        loop {
            let signal = {
                let data = self.data.read().unwrap();
                if let Some(key) = data.keys.get(chid) {
                    return Ok(key.clone());
                }
                match data.pending.get(chid) {
                    Some(pending) => pending.wait.clone(),
                    None => return Err(Error::ChannelNotFound),
                }
            };
            if timeout(self.config.pending_channel_timeout, signal.recv())
                .await
                .is_err()
            {
                return Err(Error::ChannelNotFound);
            }
        }
    }

    /// Drains the error stream of an outgoing request. Completion is raised
    /// from the last error seen, except after a local cancel; state always
    /// goes away.
    fn execute_request(&self, chid: ChannelId, mut errors: mpsc::Receiver<Error>) {
        let transport = self.clone();
        spawn(async move {
            let mut last_error = None;
            while let Some(err) = errors.next().await {
                last_error = Some(err);
            }
            let cancelled = match last_error {
                Some(Error::RequestCancelled) => true,
                _ => false,
            };
            if !cancelled {
                let success = last_error.is_none();
                if let Ok(events) = transport.events() {
                    if let Err(e) = events.on_channel_completed(&chid, success) {
                        log::error!("completion handler failed for {}: {}", chid, e);
                    }
                }
            }
            let mut data = transport.data.write().unwrap();
            data.remove_channel(&chid);
        });
    }

    /// Shared path for extensions arriving on response hooks and request
    /// updates: decode, check the message rides on the side of the channel
    /// that opened it, then dispatch.
    fn process_extension(
        &self,
        chid: &ChannelId,
        extensions: &Extensions,
        p: &PeerId,
    ) -> (Option<TransferResponse>, Result<(), Error>) {
        let msg = match TransferMessage::from_extensions(extensions) {
            Ok(Some(msg)) => msg,
            Ok(None) => return (None, Ok(())),
            Err(e) => return (None, Err(e)),
        };
        let events = match self.events() {
            Ok(events) => events,
            Err(e) => return (None, Err(e)),
        };
        let is_rq = msg.is_rq;
        match (is_rq, msg.request, msg.response) {
            (true, Some(request), _) => {
                if chid.initiator != *p || chid.id != request.transfer_id {
                    return (None, Err(Error::RequestOnResponseChannel));
                }
                events.on_request_received(chid, &request)
            }
            (false, _, Some(response)) => {
                if chid.initiator != self.peer_id || chid.id != response.transfer_id {
                    return (None, Err(Error::ResponseOnRequestChannel));
                }
                (None, events.on_response_received(chid, &response))
            }
            _ => (
                None,
                Err(Error::Encoding("invalid transfer message".to_string())),
            ),
        }
    }
}

#[async_trait]
impl<G: GraphExchange + 'static> Transport for GraphsyncTransport<G> {
    fn open_channel(
        &self,
        data_sender: PeerId,
        chid: ChannelId,
        root: Cid,
        selector: Selector,
        msg: TransferMessage,
    ) -> Result<(), Error> {
        self.events()?;
        let extensions = msg.to_extensions()?;
        let (cancel, cancelled) = oneshot::channel();
        {
            let mut data = self.data.write().unwrap();
            data.new_pending(chid.clone(), cancel);
        }
        let errors = self
            .gs
            .request(data_sender, root, selector, extensions, cancelled);
        self.execute_request(chid, errors);
        Ok(())
    }

    async fn close_channel(&self, chid: &ChannelId) -> Result<(), Error> {
        self.events()?;
        let key = self.gs_key(chid).await?;
        if key.peer == self.peer_id {
            // requester side: fire the cancel handle and let the error
            // stream consumer observe the cancel
            let cancel = { self.data.write().unwrap().cancel.remove(chid) };
            return match cancel {
                Some(cancel) => {
                    let _ = cancel.send(());
                    Ok(())
                }
                None => Err(Error::ChannelNotFound),
            };
        }
        let already_cancelled = {
            let mut data = self.data.write().unwrap();
            if data.requestor_cancelled.contains(chid) {
                data.remove_channel(chid);
                true
            } else {
                false
            }
        };
        if already_cancelled {
            return Ok(());
        }
        self.gs.cancel_response(&key.peer, key.request_id)
    }

    fn set_event_handler(&self, events: Arc<dyn Events>) -> Result<(), Error> {
        {
            let mut slot = self.events.write().unwrap();
            if slot.is_some() {
                return Err(Error::HandlerAlreadySet);
            }
            *slot = Some(events);
        }
        self.gs.register_hooks(Arc::new(self.clone()));
        Ok(())
    }

    fn cleanup_channel(&self, chid: &ChannelId) {
        let mut data = self.data.write().unwrap();
        data.remove_channel(chid);
    }

    fn pauseable(&self) -> Option<&dyn PauseableTransport> {
        Some(self)
    }
}

#[async_trait]
impl<G: GraphExchange + 'static> PauseableTransport for GraphsyncTransport<G> {
    async fn pause_channel(&self, chid: &ChannelId) -> Result<(), Error> {
        self.events()?;
        let key = self.gs_key(chid).await?;
        if key.peer == self.peer_id {
            return self.gs.pause_request(key.request_id);
        }
        {
            let data = self.data.read().unwrap();
            if data.requestor_cancelled.contains(chid) {
                return Ok(());
            }
        }
        self.gs.pause_response(&key.peer, key.request_id)
    }

    async fn resume_channel(
        &self,
        msg: Option<TransferMessage>,
        chid: &ChannelId,
    ) -> Result<(), Error> {
        self.events()?;
        let key = self.gs_key(chid).await?;
        let mut extensions = Extensions::default();
        if let Some(msg) = msg {
            extensions = msg.to_extensions()?;
        }
        if key.peer == self.peer_id {
            return self.gs.unpause_request(key.request_id, extensions);
        }
        {
            let mut data = self.data.write().unwrap();
            if data.requestor_cancelled.contains(chid) {
                // the remote tore its request down; hold the message until
                // its next request for this channel comes in
                data.pending_extensions
                    .entry(chid.clone())
                    .or_default()
                    .extend(extensions);
                return Ok(());
            }
        }
        self.gs.unpause_response(&key.peer, key.request_id, extensions)
    }
}

impl<G: GraphExchange + 'static> GraphsyncHooks for GraphsyncTransport<G> {
    fn outgoing_request(&self, p: &PeerId, request: &GraphsyncRequest) {
        // extension missing or unreadable: not a transfer of ours
        let msg = match TransferMessage::from_extensions(&request.extensions) {
            Ok(Some(msg)) => msg,
            _ => return,
        };
        let (is_rq, transfer_id) = match (&msg.request, &msg.response) {
            (Some(request), _) if msg.is_rq => (true, request.transfer_id),
            (_, Some(response)) if !msg.is_rq => (false, response.transfer_id),
            _ => return,
        };
        let chid = message_channel(is_rq, transfer_id, &self.peer_id, p);
        let events = match self.events() {
            Ok(events) => events,
            Err(_) => return,
        };
        let opened = events.on_channel_opened(&chid);
        let mut data = self.data.write().unwrap();
        if opened.is_ok() {
            let key = GraphsyncKey {
                request_id: request.id,
                peer: self.peer_id.clone(),
            };
            data.bind_outgoing(chid, key);
        } else {
            // leave the channel unbound so control calls report not-found,
            // but wake anything parked on the pending signal
            data.close_pending(&chid);
        }
    }

    fn incoming_block(
        &self,
        _p: &PeerId,
        response: &GraphsyncResponse,
        block: &BlockData,
        actions: &mut IncomingBlockActions,
    ) {
        let key = GraphsyncKey {
            request_id: response.id,
            peer: self.peer_id.clone(),
        };
        let chid = match self.data.read().unwrap().channel(&key) {
            Some(chid) => chid,
            None => return,
        };
        let events = match self.events() {
            Ok(events) => events,
            Err(_) => return,
        };
        match events.on_data_received(&chid, &block.link, block.size) {
            Ok(()) => {}
            Err(Error::Pause) => actions.pause_request(),
            Err(e) => actions.terminate_with_error(e),
        }
    }

    fn outgoing_block(
        &self,
        p: &PeerId,
        request: &GraphsyncRequest,
        block: &BlockData,
        actions: &mut OutgoingBlockActions,
    ) {
        let chid = {
            let mut data = self.data.write().unwrap();
            let key = GraphsyncKey {
                request_id: request.id,
                peer: p.clone(),
            };
            let chid = match data.channel(&key) {
                Some(chid) => chid,
                None => return,
            };
            let rp = data.progress.entry(chid.clone()).or_default();
            rp.current_sent += block.size as u64;
            if rp.current_sent <= rp.maximum_sent {
                // the block transport re-sent a block we already accounted
                return;
            }
            rp.maximum_sent = rp.current_sent;
            chid
        };
        let events = match self.events() {
            Ok(events) => events,
            Err(_) => return,
        };
        let (msg, result) = events.on_data_sent(&chid, &block.link, block.size);
        match result {
            Ok(()) => {}
            Err(Error::Pause) => actions.pause_response(),
            Err(e) => {
                actions.terminate_with_error(e);
                return;
            }
        }
        if let Some(msg) = msg {
            match msg.marshal_cbor() {
                Ok(data) => actions.send_extension_data(EXTENSION_KEY.to_string(), data),
                Err(e) => actions.terminate_with_error(e),
            }
        }
    }

    fn incoming_request(
        &self,
        p: &PeerId,
        request: &GraphsyncRequest,
        actions: &mut IncomingRequestActions,
    ) {
        let msg = match TransferMessage::from_extensions(&request.extensions) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                actions.terminate_with_error(e);
                return;
            }
        };
        let events = match self.events() {
            Ok(events) => events,
            Err(_) => return,
        };
        let is_rq = msg.is_rq;
        let (chid, response, result) = match (is_rq, msg.request, msg.response) {
            (true, Some(dt_request), _) => {
                // a request arriving on the block transport is a pull
                let chid = message_channel(true, dt_request.transfer_id, p, &self.peer_id);
                let (response, result) = events.on_request_received(&chid, &dt_request);
                (chid, response, result)
            }
            (false, _, Some(dt_response)) => {
                // a response arriving on the block transport answers a push
                let chid = message_channel(false, dt_response.transfer_id, p, &self.peer_id);
                let result = events.on_response_received(&chid, &dt_response);
                (chid, None, result)
            }
            _ => {
                actions.terminate_with_error(Error::Encoding(
                    "invalid transfer message".to_string(),
                ));
                return;
            }
        };
        if let Some(response) = response {
            let outbound = TransferMessage {
                is_rq: false,
                request: None,
                response: Some(response),
            };
            match outbound.marshal_cbor() {
                Ok(data) => actions.send_extension_data(EXTENSION_KEY.to_string(), data),
                Err(e) => {
                    actions.terminate_with_error(e);
                    return;
                }
            }
        }
        match result {
            Ok(()) => {}
            Err(Error::Pause) => actions.pause_response(),
            Err(e) => {
                actions.terminate_with_error(e);
                return;
            }
        }
        {
            let mut data = self.data.write().unwrap();
            if data.requestor_cancelled.remove(&chid) {
                let queued = data.pending_extensions.remove(&chid).unwrap_or_default();
                for (name, ext) in queued {
                    actions.send_extension_data(name, ext);
                }
            }
            let key = GraphsyncKey {
                request_id: request.id,
                peer: p.clone(),
            };
            data.bind_incoming(chid, key);
        }
        actions.validate_request();
    }

    fn incoming_response(
        &self,
        p: &PeerId,
        response: &GraphsyncResponse,
        actions: &mut IncomingResponseActions,
    ) {
        let key = GraphsyncKey {
            request_id: response.id,
            peer: self.peer_id.clone(),
        };
        let chid = match self.data.read().unwrap().channel(&key) {
            Some(chid) => chid,
            None => return,
        };
        let (outbound, result) = self.process_extension(&chid, &response.extensions, p);
        if let Some(outbound) = outbound {
            let msg = TransferMessage {
                is_rq: false,
                request: None,
                response: Some(outbound),
            };
            match msg.marshal_cbor() {
                Ok(data) => {
                    actions.update_request_with_extensions(EXTENSION_KEY.to_string(), data)
                }
                Err(e) => {
                    actions.terminate_with_error(e);
                    return;
                }
            }
        }
        if let Err(e) = result {
            actions.terminate_with_error(e);
        }
    }

    fn request_updated(
        &self,
        p: &PeerId,
        request: &GraphsyncRequest,
        update: &GraphsyncRequest,
        actions: &mut RequestUpdatedActions,
    ) {
        let key = GraphsyncKey {
            request_id: request.id,
            peer: p.clone(),
        };
        let chid = match self.data.read().unwrap().channel(&key) {
            Some(chid) => chid,
            None => return,
        };
        let (outbound, result) = self.process_extension(&chid, &update.extensions, p);
        if let Some(outbound) = outbound {
            let msg = TransferMessage {
                is_rq: false,
                request: None,
                response: Some(outbound),
            };
            match msg.marshal_cbor() {
                Ok(data) => actions.send_extension_data(EXTENSION_KEY.to_string(), data),
                Err(e) => {
                    actions.terminate_with_error(e);
                    return;
                }
            }
        }
        if let Err(e) = result {
            actions.terminate_with_error(e);
        }
    }

    fn response_completed(
        &self,
        p: &PeerId,
        request: &GraphsyncRequest,
        status: ResponseStatusCode,
    ) {
        let key = GraphsyncKey {
            request_id: request.id,
            peer: p.clone(),
        };
        let chid = match self.data.read().unwrap().channel(&key) {
            Some(chid) => chid,
            None => return,
        };
        if status != ResponseStatusCode::RequestCancelled {
            let success = status == ResponseStatusCode::RequestCompletedFull;
            if let Ok(events) = self.events() {
                if let Err(e) = events.on_channel_completed(&chid, success) {
                    log::error!("completion handler failed for {}: {}", chid, e);
                }
            }
        }
        self.data.write().unwrap().remove_channel(&chid);
    }

    fn requestor_cancelled(&self, p: &PeerId, request: &GraphsyncRequest) {
        let mut data = self.data.write().unwrap();
        let key = GraphsyncKey {
            request_id: request.id,
            peer: p.clone(),
        };
        if let Some(chid) = data.channel(&key) {
            data.requestor_cancelled.insert(chid);
        }
    }
}
