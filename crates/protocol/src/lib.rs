//! Wire-level types for RFC 6962 Certificate Transparency logs.
//!
//! This crate covers the pieces of the protocol a monitor consumes:
//! log identifiers and keys, signed tree heads and their signature
//! verification, `MerkleTreeLeaf` decoding, the JSON envelopes of the
//! `ct/v1` endpoints, and the log list schema the monitor is driven
//! from. The HTTP transport lives in `certwatch-client`; the Merkle
//! math lives in `certwatch-merkle`.

pub mod api;
mod id;
mod key;
pub mod leaf;
pub mod loglist;
mod sth;
pub mod tls;

pub use id::LogId;
pub use key::{KeyError, LogKey, SignatureAlgorithm};
pub use sth::{DigitallySigned, SignedTreeHead, SthError};
