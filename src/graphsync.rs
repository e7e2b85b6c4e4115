use crate::selector::Selector;
use crate::Error;
use futures::channel::{mpsc, oneshot};
use libipld::Cid;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::Arc;

pub type RequestId = i32;
pub type ExtensionName = String;
pub type Extensions = HashMap<ExtensionName, Vec<u8>>;

#[derive(Debug, PartialEq, Clone)]
pub struct GraphsyncRequest {
    pub id: RequestId,
    pub root: Cid,
    pub selector: Selector,
    pub extensions: Extensions,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GraphsyncResponse {
    pub id: RequestId,
    pub status: ResponseStatusCode,
    pub extensions: Extensions,
}

/// One block as seen by the block hooks.
#[derive(Debug, PartialEq, Clone)]
pub struct BlockData {
    pub link: Cid,
    pub size: usize,
}

#[derive(PartialEq, Clone, Copy, Eq, Debug)]
pub enum ResponseStatusCode {
    RequestAcknowledged,
    PartialResponse,
    RequestPaused,
    RequestCompletedFull,
    RequestCompletedPartial,
    RequestRejected,
    RequestFailedBusy,
    RequestFailedUnknown,
    RequestFailedLegal,
    RequestFailedContentNotFound,
    RequestCancelled,
}

/// The block-exchange protocol underneath the transport. Implementations
/// carry the actual DAG blocks; the transport only drives requests and
/// consumes the hooks it registered.
pub trait GraphExchange: Send + Sync {
    /// Starts an outgoing request. The returned stream carries any errors the
    /// request hits and closes once the request is done; a final
    /// [`Error::RequestCancelled`] means the `cancel` handle fired. The
    /// request id is learned through the outgoing request hook, not here.
    fn request(
        &self,
        peer: PeerId,
        root: Cid,
        selector: Selector,
        extensions: Extensions,
        cancel: oneshot::Receiver<()>,
    ) -> mpsc::Receiver<Error>;
    fn pause_request(&self, id: RequestId) -> Result<(), Error>;
    fn unpause_request(&self, id: RequestId, extensions: Extensions) -> Result<(), Error>;
    fn pause_response(&self, peer: &PeerId, id: RequestId) -> Result<(), Error>;
    fn unpause_response(
        &self,
        peer: &PeerId,
        id: RequestId,
        extensions: Extensions,
    ) -> Result<(), Error>;
    fn cancel_response(&self, peer: &PeerId, id: RequestId) -> Result<(), Error>;
    fn register_hooks(&self, hooks: Arc<dyn GraphsyncHooks>);
}

/// Callbacks fired by the block transport at each step of a request's life.
/// Hooks record their effect on the passed action collector; the block
/// transport applies the collected actions when the hook returns.
pub trait GraphsyncHooks: Send + Sync {
    fn outgoing_request(&self, peer: &PeerId, request: &GraphsyncRequest);
    fn incoming_block(
        &self,
        peer: &PeerId,
        response: &GraphsyncResponse,
        block: &BlockData,
        actions: &mut IncomingBlockActions,
    );
    fn outgoing_block(
        &self,
        peer: &PeerId,
        request: &GraphsyncRequest,
        block: &BlockData,
        actions: &mut OutgoingBlockActions,
    );
    fn incoming_request(
        &self,
        peer: &PeerId,
        request: &GraphsyncRequest,
        actions: &mut IncomingRequestActions,
    );
    fn incoming_response(
        &self,
        peer: &PeerId,
        response: &GraphsyncResponse,
        actions: &mut IncomingResponseActions,
    );
    fn request_updated(
        &self,
        peer: &PeerId,
        request: &GraphsyncRequest,
        update: &GraphsyncRequest,
        actions: &mut RequestUpdatedActions,
    );
    fn response_completed(&self, peer: &PeerId, request: &GraphsyncRequest, status: ResponseStatusCode);
    fn requestor_cancelled(&self, peer: &PeerId, request: &GraphsyncRequest);
}

#[derive(Debug, Default)]
pub struct IncomingBlockActions {
    paused: bool,
    error: Option<Error>,
}

impl IncomingBlockActions {
    pub fn pause_request(&mut self) {
        self.paused = true;
    }
    pub fn terminate_with_error(&mut self, err: Error) {
        self.error = Some(err);
    }
    pub fn paused(&self) -> bool {
        self.paused
    }
    pub fn termination_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct OutgoingBlockActions {
    paused: bool,
    error: Option<Error>,
    extensions: Vec<(ExtensionName, Vec<u8>)>,
}

impl OutgoingBlockActions {
    pub fn pause_response(&mut self) {
        self.paused = true;
    }
    pub fn terminate_with_error(&mut self, err: Error) {
        self.error = Some(err);
    }
    pub fn send_extension_data(&mut self, name: ExtensionName, data: Vec<u8>) {
        self.extensions.push((name, data));
    }
    pub fn paused(&self) -> bool {
        self.paused
    }
    pub fn termination_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    pub fn sent_extensions(&self) -> &[(ExtensionName, Vec<u8>)] {
        &self.extensions
    }
}

#[derive(Debug, Default)]
pub struct IncomingRequestActions {
    validated: bool,
    paused: bool,
    error: Option<Error>,
    extensions: Vec<(ExtensionName, Vec<u8>)>,
}

impl IncomingRequestActions {
    pub fn validate_request(&mut self) {
        self.validated = true;
    }
    pub fn pause_response(&mut self) {
        self.paused = true;
    }
    pub fn terminate_with_error(&mut self, err: Error) {
        self.error = Some(err);
    }
    pub fn send_extension_data(&mut self, name: ExtensionName, data: Vec<u8>) {
        self.extensions.push((name, data));
    }
    pub fn validated(&self) -> bool {
        self.validated
    }
    pub fn paused(&self) -> bool {
        self.paused
    }
    pub fn termination_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    pub fn sent_extensions(&self) -> &[(ExtensionName, Vec<u8>)] {
        &self.extensions
    }
}

#[derive(Debug, Default)]
pub struct IncomingResponseActions {
    error: Option<Error>,
    update_extensions: Vec<(ExtensionName, Vec<u8>)>,
}

impl IncomingResponseActions {
    pub fn terminate_with_error(&mut self, err: Error) {
        self.error = Some(err);
    }
    /// Sends the extension back to the responder piggybacked on a request
    /// update.
    pub fn update_request_with_extensions(&mut self, name: ExtensionName, data: Vec<u8>) {
        self.update_extensions.push((name, data));
    }
    pub fn termination_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    pub fn update_extensions(&self) -> &[(ExtensionName, Vec<u8>)] {
        &self.update_extensions
    }
}

#[derive(Debug, Default)]
pub struct RequestUpdatedActions {
    error: Option<Error>,
    extensions: Vec<(ExtensionName, Vec<u8>)>,
}

impl RequestUpdatedActions {
    pub fn terminate_with_error(&mut self, err: Error) {
        self.error = Some(err);
    }
    pub fn send_extension_data(&mut self, name: ExtensionName, data: Vec<u8>) {
        self.extensions.push((name, data));
    }
    pub fn termination_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    pub fn sent_extensions(&self) -> &[(ExtensionName, Vec<u8>)] {
        &self.extensions
    }
}
