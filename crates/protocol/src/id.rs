use core::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Identifies a log: the SHA-256 digest of its DER-encoded
/// `SubjectPublicKeyInfo` (RFC 6962 section 3.2).
///
/// All per-log state is keyed by this value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogId([u8; 32]);

impl LogId {
    /// Computes the id for a log's DER-encoded public key.
    pub fn from_spki(spki_der: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(spki_der.as_ref()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// URL-safe form without padding, suitable for file and directory
    /// names.
    pub fn to_path_component(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl From<[u8; 32]> for LogId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for LogId {
    type Error = InvalidLogId;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InvalidLogId)?;
        Ok(Self(bytes))
    }
}

/// The value was not a base64 encoded 32 byte digest.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("a log id is the base64 encoding of a 32 byte digest")]
pub struct InvalidLogId;

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for LogId {
    type Err = InvalidLogId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD.decode(s).map_err(|_| InvalidLogId)?;
        Self::try_from(bytes.as_slice())
    }
}

impl Serialize for LogId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LogId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = LogId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base64 encoded log id")
            }

            fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let id = LogId::from_spki(b"not really a key");
        assert_eq!(id.to_string().parse::<LogId>().unwrap(), id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<LogId>(&json).unwrap(), id);
    }

    #[test]
    fn test_path_component_has_no_separators() {
        let id = LogId::from_spki([0xffu8; 91]);
        let path = id.to_path_component();
        assert!(!path.contains(['/', '+', '=']));
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!("AAEC".parse::<LogId>().is_err());
    }
}
