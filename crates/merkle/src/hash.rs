use core::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A SHA-256 hash of a node in a Merkle tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TreeHash([u8; 32]);

/// Domain-separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;
/// Domain-separation prefix for branch hashes.
const BRANCH_PREFIX: u8 = 0x01;

/// Hashes a leaf entry: `SHA-256(0x00 || entry)`.
pub fn hash_leaf(entry: impl AsRef<[u8]>) -> TreeHash {
    let mut digest = Sha256::new();
    digest.update([LEAF_PREFIX]);
    digest.update(entry.as_ref());
    TreeHash(digest.finalize().into())
}

/// Hashes a branch node: `SHA-256(0x01 || left || right)`.
pub fn hash_branch(left: &TreeHash, right: &TreeHash) -> TreeHash {
    let mut digest = Sha256::new();
    digest.update([BRANCH_PREFIX]);
    digest.update(left.0);
    digest.update(right.0);
    TreeHash(digest.finalize().into())
}

/// The hash of the empty tree: `SHA-256("")`.
pub fn hash_empty() -> TreeHash {
    TreeHash(Sha256::digest([]).into())
}

impl TreeHash {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encodes the hash as standard base64, the form it takes in CT
    /// wire messages and persisted state.
    pub fn to_base64(self) -> String {
        STANDARD.encode(self.0)
    }
}

impl From<[u8; 32]> for TreeHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for TreeHash {
    type Error = InvalidHashLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InvalidHashLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

/// The byte slice was not exactly 32 bytes long.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected a 32 byte hash, found {0} bytes")]
pub struct InvalidHashLength(pub usize);

impl AsRef<[u8]> for TreeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for TreeHash {
    type Err = InvalidHashLength;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD.decode(s).map_err(|_| InvalidHashLength(0))?;
        Self::try_from(bytes.as_slice())
    }
}

impl Serialize for TreeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for TreeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Base64Visitor;

        impl Visitor<'_> for Base64Visitor {
            type Value = TreeHash;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base64 encoded 32 byte hash")
            }

            fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
                let bytes = STANDARD
                    .decode(v)
                    .map_err(|e| E::custom(format_args!("invalid base64: {e}")))?;
                TreeHash::try_from(bytes.as_slice()).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Base64Visitor)
    }
}
