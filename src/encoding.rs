use crate::Error;
use libipld::Cid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_cbor::tags::Tagged;
use std::fmt;

const CBOR_TAG_CID: u64 = 42;
const MULTIBASE_IDENTITY: u8 = 0;

/// Objects with a canonical CBOR representation.
pub trait Cbor: Serialize + DeserializeOwned {
    fn marshal_cbor(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_cbor::to_vec(&self)?)
    }
    fn unmarshal_cbor(bz: &[u8]) -> Result<Self, Error> {
        Ok(serde_cbor::from_slice(bz)?)
    }
}

/// Wrapper encoding a [Cid] as a CBOR tag 42 byte string with the identity
/// multibase prefix.
#[derive(PartialEq, Eq, Clone, Default, Hash, PartialOrd, Ord, Debug)]
pub struct CidCbor {
    pub bytes: Vec<u8>,
}

impl CidCbor {
    pub fn to_cid(&self) -> Option<Cid> {
        Cid::try_from(self.bytes.clone()).ok()
    }
}

impl Serialize for CidCbor {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut cid_bytes = self.bytes.clone();
        cid_bytes.insert(0, MULTIBASE_IDENTITY);
        let value = serde_bytes::Bytes::new(&cid_bytes);
        Tagged::new(Some(CBOR_TAG_CID), &value).serialize(s)
    }
}

impl<'de> Deserialize<'de> for CidCbor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tagged = Tagged::<serde_bytes::ByteBuf>::deserialize(deserializer)?;
        match tagged.tag {
            Some(CBOR_TAG_CID) | None => {
                let mut bz = tagged.value.into_vec();
                if bz.first() == Some(&MULTIBASE_IDENTITY) {
                    bz.remove(0);
                }
                Ok(CidCbor { bytes: bz })
            }
            Some(_) => Err(serde::de::Error::custom("unexpected tag")),
        }
    }
}

impl From<Cid> for CidCbor {
    fn from(cid: Cid) -> Self {
        Self {
            bytes: cid.to_bytes(),
        }
    }
}

impl fmt::Display for CidCbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cid) = self.to_cid() {
            write!(f, "{}", cid)
        } else {
            write!(f, "invalid cid")
        }
    }
}
