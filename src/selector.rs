use crate::empty_map;
use crate::encoding::Cbor;
use serde::{Deserialize, Serialize};

/// IPLD selector describing the sub-DAG a transfer covers. The transport
/// never interprets it; it travels inside requests and is handed to the
/// block transport verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Selector {
    #[serde(rename = "a")]
    ExploreAll {
        #[serde(rename = ">")]
        next: Box<Selector>,
    },
    #[serde(rename = "R")]
    ExploreRecursive {
        #[serde(rename = "l")]
        limit: RecursionLimit,
        #[serde(rename = ":>")]
        sequence: Box<Selector>,
    },
    #[serde(rename = "@", with = "empty_map")]
    ExploreRecursiveEdge,
    #[serde(rename = ".", with = "empty_map")]
    Matcher,
}

impl Cbor for Selector {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy)]
pub enum RecursionLimit {
    #[serde(rename = "none", with = "empty_map")]
    None,
    #[serde(rename = "depth")]
    Depth(u64),
}
