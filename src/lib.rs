mod empty_map;
pub mod encoding;
pub mod graphsync;
pub mod message;
pub mod receiver;
pub mod selector;
pub mod transport;

pub use message::{TransferMessage, TransferRequest, TransferResponse, EXTENSION_KEY};
pub use receiver::{DataTransferNetwork, Receiver, PROTOCOL_DATA_TRANSFER};
pub use selector::Selector;
pub use transport::{Config, GraphsyncKey, GraphsyncTransport};

use async_trait::async_trait;
use libipld::Cid;
use libp2p::PeerId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifier minted by the peer that starts a transfer. Request ids on the
/// block transport are scoped per peer; transfer ids are scoped per initiator.
pub type TransferId = u64;

/// A logical directional transfer between two peers. The initiator is the
/// peer that sent the original transfer request, regardless of which way the
/// data flows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub initiator: PeerId,
    pub responder: PeerId,
    pub id: TransferId,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}-{}", self.initiator, self.responder, self.id)
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum Error {
    /// Control value returned by event handlers to pause the channel.
    #[error("pause channel")]
    Pause,
    /// Control value returned by event handlers to resume the channel.
    #[error("resume channel")]
    Resume,
    #[error("channel not found")]
    ChannelNotFound,
    #[error("event handler has not been set")]
    HandlerNotSet,
    #[error("already set event handler")]
    HandlerAlreadySet,
    /// Final error on the request error stream when the local peer cancelled.
    #[error("request cancelled")]
    RequestCancelled,
    #[error("received request on response channel")]
    RequestOnResponseChannel,
    #[error("received response on request channel")]
    ResponseOnRequestChannel,
    #[error("transport does not support pause/resume")]
    Unpauseable,
    #[error("{0}")]
    Encoding(String),
    #[error("{0}")]
    Custom(String),
}

impl From<serde_cbor::Error> for Error {
    fn from(err: serde_cbor::Error) -> Error {
        Self::Encoding(err.to_string())
    }
}

/// Contract between the transport and the enclosing manager. The manager
/// supplies an implementation on [`Transport::set_event_handler`]; the
/// transport never holds any other reference back into the manager.
///
/// Handlers signal flow control by returning the [`Error::Pause`] and
/// [`Error::Resume`] sentinels; any other error is treated as fatal to the
/// operation that raised the event. Hooks that can carry a reply return it
/// alongside the result so a response travels even when the handler rejects.
pub trait Events: Send + Sync {
    /// The block transport accepted our outgoing request for this channel.
    fn on_channel_opened(&self, chid: &ChannelId) -> Result<(), Error>;
    /// A block arrived on a channel we requested.
    fn on_data_received(&self, chid: &ChannelId, link: &Cid, size: usize) -> Result<(), Error>;
    /// A block went out on a channel we are responding to. Raised once per
    /// logical block even if the block transport re-sends.
    fn on_data_sent(
        &self,
        chid: &ChannelId,
        link: &Cid,
        size: usize,
    ) -> (Option<TransferMessage>, Result<(), Error>);
    /// A new transfer request or a request update reached us.
    fn on_request_received(
        &self,
        chid: &ChannelId,
        request: &TransferRequest,
    ) -> (Option<TransferResponse>, Result<(), Error>);
    /// The remote answered one of our transfer requests.
    fn on_response_received(
        &self,
        chid: &ChannelId,
        response: &TransferResponse,
    ) -> Result<(), Error>;
    /// The channel finished; fired at most once, never after a local cancel.
    fn on_channel_completed(&self, chid: &ChannelId, success: bool) -> Result<(), Error>;
}

/// Minimal operations every data-transfer transport exposes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues an outgoing block-transport request to `data_sender` carrying
    /// `msg` as extension data. Returns as soon as the request is handed off.
    fn open_channel(
        &self,
        data_sender: PeerId,
        chid: ChannelId,
        root: Cid,
        selector: Selector,
        msg: TransferMessage,
    ) -> Result<(), Error>;
    /// Closes the channel, waiting for the binding if the open is still in
    /// flight.
    async fn close_channel(&self, chid: &ChannelId) -> Result<(), Error>;
    /// Single assignment; registers all block-transport hooks.
    fn set_event_handler(&self, events: Arc<dyn Events>) -> Result<(), Error>;
    /// Drops all state for a channel after an externally observed cancel.
    fn cleanup_channel(&self, chid: &ChannelId);
    /// Pause/resume support when the concrete transport has it.
    fn pauseable(&self) -> Option<&dyn PauseableTransport> {
        None
    }
}

/// Transports that can suspend and resume a live channel.
#[async_trait]
pub trait PauseableTransport: Transport {
    async fn pause_channel(&self, chid: &ChannelId) -> Result<(), Error>;
    /// `msg` rides along with the unpause as extension data when present.
    async fn resume_channel(
        &self,
        msg: Option<TransferMessage>,
        chid: &ChannelId,
    ) -> Result<(), Error>;
}
