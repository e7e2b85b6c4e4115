use crate::encoding::{Cbor, CidCbor};
use crate::graphsync::Extensions;
use crate::selector::Selector;
use crate::Error;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Extension name under which signalling rides inside block-transport
/// requests and responses.
pub static EXTENSION_KEY: &str = "fil/data-transfer";

#[derive(Debug, PartialEq, Clone, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum MessageType {
    New = 0,
    Update,
    Cancel,
    Complete,
    Voucher,
    VoucherResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "BCid")]
    pub root: CidCbor,
    #[serde(rename = "Type")]
    pub mtype: MessageType,
    #[serde(rename = "Paus")]
    pub pause: bool,
    #[serde(rename = "Part")]
    pub partial: bool,
    #[serde(rename = "Pull")]
    pub pull: bool,
    #[serde(rename = "Stor")]
    pub selector: Selector,
    #[serde(rename = "Vouch")]
    pub voucher: Option<Value>,
    #[serde(rename = "VTyp")]
    pub voucher_type: String,
    #[serde(rename = "XferID")]
    pub transfer_id: u64,
}

impl TransferRequest {
    pub fn is_new(&self) -> bool {
        self.mtype == MessageType::New
    }
    pub fn is_update(&self) -> bool {
        self.mtype == MessageType::Update
    }
    pub fn is_cancel(&self) -> bool {
        self.mtype == MessageType::Cancel
    }
    pub fn is_paused(&self) -> bool {
        self.pause
    }
    pub fn is_pull(&self) -> bool {
        self.pull
    }
}

impl Default for TransferRequest {
    fn default() -> Self {
        Self {
            root: Default::default(),
            mtype: MessageType::New,
            pause: false,
            partial: false,
            pull: true,
            selector: Selector::ExploreRecursive {
                limit: crate::selector::RecursionLimit::None,
                sequence: Box::new(Selector::ExploreAll {
                    next: Box::new(Selector::ExploreRecursiveEdge),
                }),
            },
            voucher: None,
            voucher_type: String::new(),
            transfer_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransferResponse {
    #[serde(rename = "Acpt")]
    pub accepted: bool,
    #[serde(rename = "Updt")]
    pub update: bool,
    #[serde(rename = "XferID")]
    pub transfer_id: u64,
    #[serde(rename = "VRes")]
    pub voucher_result: Option<Value>,
    #[serde(rename = "VTyp")]
    pub voucher_type: String,
}

impl TransferResponse {
    pub fn is_update(&self) -> bool {
        self.update
    }
}

/// Envelope carried on the wire: exactly one of the two sub-records is
/// present, named by the `IsRq` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TransferMessage {
    #[serde(default = "not_req")]
    pub is_rq: bool,
    pub request: Option<TransferRequest>,
    pub response: Option<TransferResponse>,
}

fn not_req() -> bool {
    false
}

impl Cbor for TransferMessage {}

impl TransferMessage {
    pub fn is_request(&self) -> bool {
        self.is_rq
    }

    /// Reads the signalling extension out of a block-transport extension set.
    /// Returns `Ok(None)` when no extension is attached, which callers must
    /// treat differently from a present-but-unparseable one.
    pub fn from_extensions(ext: &Extensions) -> Result<Option<Self>, Error> {
        let data = match ext.get(EXTENSION_KEY) {
            Some(data) => data,
            None => return Ok(None),
        };
        let msg = TransferMessage::unmarshal_cbor(data)?;
        if msg.is_rq && msg.request.is_none() || !msg.is_rq && msg.response.is_none() {
            return Err(Error::Encoding(
                "transfer message is missing its payload".to_string(),
            ));
        }
        Ok(Some(msg))
    }

    /// Encodes this message into a one-entry extension set.
    pub fn to_extensions(&self) -> Result<Extensions, Error> {
        let mut extensions = Extensions::default();
        extensions.insert(EXTENSION_KEY.to_string(), self.marshal_cbor()?);
        Ok(extensions)
    }
}
