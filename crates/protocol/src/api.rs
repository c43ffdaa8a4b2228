//! JSON envelopes of the `ct/v1` monitoring endpoints
//! (RFC 6962 section 4).

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::sth::SignedTreeHead;

/// Response body of `get-sth` (section 4.3).
///
/// The field names line up with [`SignedTreeHead`]'s serde
/// representation, so the response *is* the tree head.
pub type GetSthResponse = SignedTreeHead;

/// Response body of `get-sth-consistency` (section 4.4).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConsistencyResponse {
    #[serde_as(as = "Vec<Base64>")]
    pub consistency: Vec<Vec<u8>>,
}

/// Response body of `get-entries` (section 4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<RawEntry>,
}

/// One element of a `get-entries` response: the raw leaf bytes and
/// the chain data that accompanies them.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    #[serde_as(as = "Base64")]
    pub leaf_input: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub extra_data: Vec<u8>,
}

/// Response body of `get-roots` (section 4.7).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRootsResponse {
    #[serde_as(as = "Vec<Base64>")]
    pub certificates: Vec<Vec<u8>>,
}
