use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;

use certwatch_merkle::TreeHash;

use crate::key::{KeyError, LogKey, SignatureAlgorithm};
use crate::tls::{DecodeError, Reader};

/// A signed tree head (RFC 6962 section 3.5): a log's signed
/// commitment to its state at one point in time.
///
/// The serde representation matches both the `get-sth` response body
/// and the persisted form, so observed heads round-trip losslessly.
/// Two heads describe the same tree iff `(tree_size,
/// sha256_root_hash)` are equal; equal sizes with different roots are
/// a split view.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sha256_root_hash: TreeHash,
    /// The raw TLS `DigitallySigned` blob.
    #[serde_as(as = "Base64")]
    pub tree_head_signature: Vec<u8>,
}

/// An STH that failed validation.
#[derive(Error, Debug)]
pub enum SthError {
    /// `tree_size` or `timestamp` exceeded the unsigned 63-bit domain
    /// JSON integers must stay within.
    #[error("{field} {value} exceeds the 63-bit integer domain")]
    OutOfRange { field: &'static str, value: u64 },

    /// The `DigitallySigned` structure could not be decoded.
    #[error("malformed tree head signature: {0}")]
    MalformedSignature(#[from] DecodeError),

    /// The signature algorithms were not SHA-256 with ECDSA or RSA.
    #[error("unsupported signature algorithm pair ({hash}, {signature})")]
    UnsupportedAlgorithm { hash: u8, signature: u8 },

    /// The signature did not verify under the log's key.
    #[error(transparent)]
    BadSignature(#[from] KeyError),
}

/// TLS `HashAlgorithm` value for SHA-256 (RFC 5246 section 7.4.1.4.1).
const HASH_ALGORITHM_SHA256: u8 = 4;

/// `Version` and `SignatureType` values of the signed structure
/// (RFC 6962 section 3.2).
const VERSION_V1: u8 = 0;
const SIGNATURE_TYPE_TREE_HASH: u8 = 1;

impl SignedTreeHead {
    /// Checks the numeric fields against the 63-bit domain.
    pub fn validate(&self) -> Result<(), SthError> {
        for (field, value) in [("tree_size", self.tree_size), ("timestamp", self.timestamp)] {
            if value > i64::MAX as u64 {
                return Err(SthError::OutOfRange { field, value });
            }
        }
        Ok(())
    }

    /// The TLS `TreeHeadSignature` structure the log signed.
    pub fn signed_message(&self) -> [u8; 50] {
        let mut message = [0u8; 50];
        message[0] = VERSION_V1;
        message[1] = SIGNATURE_TYPE_TREE_HASH;
        message[2..10].copy_from_slice(&self.timestamp.to_be_bytes());
        message[10..18].copy_from_slice(&self.tree_size.to_be_bytes());
        message[18..50].copy_from_slice(self.sha256_root_hash.as_bytes());
        message
    }

    /// Verifies the tree head signature under the log's public key.
    pub fn verify(&self, key: &LogKey) -> Result<(), SthError> {
        self.validate()?;
        let signature = DigitallySigned::parse(&self.tree_head_signature)?;
        key.verify(
            signature.algorithm,
            &self.signed_message(),
            &signature.signature,
        )?;
        Ok(())
    }

    pub fn timestamp_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp.min(i64::MAX as u64) as i64)
            .single()
            .unwrap_or_default()
    }

    /// Whether `self` and `other` commit to the same tree.
    pub fn same_tree(&self, other: &SignedTreeHead) -> bool {
        self.tree_size == other.tree_size && self.sha256_root_hash == other.sha256_root_hash
    }
}

/// A decoded TLS `DigitallySigned` structure (RFC 5246 section 4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitallySigned {
    pub algorithm: SignatureAlgorithm,
    pub signature: Vec<u8>,
}

impl DigitallySigned {
    pub fn parse(bytes: &[u8]) -> Result<Self, SthError> {
        let mut reader = Reader::new(bytes);
        let hash = reader.u8("hash algorithm")?;
        let signature_algorithm = reader.u8("signature algorithm")?;
        let signature = reader.opaque_u16("signature")?.to_vec();
        reader.finish()?;

        if hash != HASH_ALGORITHM_SHA256 {
            return Err(SthError::UnsupportedAlgorithm {
                hash,
                signature: signature_algorithm,
            });
        }
        let algorithm = SignatureAlgorithm::from_wire(signature_algorithm).ok_or(
            SthError::UnsupportedAlgorithm {
                hash,
                signature: signature_algorithm,
            },
        )?;

        Ok(Self {
            algorithm,
            signature,
        })
    }

    /// Encodes the structure back to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.signature.len());
        bytes.push(HASH_ALGORITHM_SHA256);
        bytes.push(self.algorithm as u8);
        bytes.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.signature);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use pretty_assertions::assert_eq;
    use signature::Signer;

    use super::*;

    fn signed_head(signing: &SigningKey, tree_size: u64, root: TreeHash) -> SignedTreeHead {
        let mut sth = SignedTreeHead {
            tree_size,
            timestamp: 1_700_000_000_000,
            sha256_root_hash: root,
            tree_head_signature: Vec::new(),
        };
        let signature: p256::ecdsa::Signature = signing.sign(&sth.signed_message());
        sth.tree_head_signature = DigitallySigned {
            algorithm: SignatureAlgorithm::Ecdsa,
            signature: signature.to_der().as_bytes().to_vec(),
        }
        .encode();
        sth
    }

    #[test]
    fn test_signed_message_layout() {
        let sth = SignedTreeHead {
            tree_size: 0x0102,
            timestamp: 0x0304,
            sha256_root_hash: TreeHash::from([0xaa; 32]),
            tree_head_signature: Vec::new(),
        };
        let message = sth.signed_message();
        assert_eq!(message[0], 0); // v1
        assert_eq!(message[1], 1); // tree_hash
        assert_eq!(message[2..10], 0x0304u64.to_be_bytes());
        assert_eq!(message[10..18], 0x0102u64.to_be_bytes());
        assert_eq!(message[18..], [0xaa; 32]);
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let spki = signing
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        let key = LogKey::from_spki_der(&spki).unwrap();

        let sth = signed_head(&signing, 42, certwatch_merkle::hash_empty());
        sth.verify(&key).unwrap();

        // Any change to the signed fields must invalidate it.
        let mut tampered = sth.clone();
        tampered.tree_size += 1;
        assert!(tampered.verify(&key).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_sizes() {
        let sth = SignedTreeHead {
            tree_size: u64::MAX,
            timestamp: 0,
            sha256_root_hash: TreeHash::from([0; 32]),
            tree_head_signature: Vec::new(),
        };
        assert!(matches!(
            sth.validate(),
            Err(SthError::OutOfRange {
                field: "tree_size",
                ..
            })
        ));
    }

    #[test]
    fn test_digitally_signed_round_trip() {
        let signed = DigitallySigned {
            algorithm: SignatureAlgorithm::Ecdsa,
            signature: vec![1, 2, 3, 4],
        };
        assert_eq!(DigitallySigned::parse(&signed.encode()).unwrap(), signed);
    }

    #[test]
    fn test_rejects_unknown_algorithms() {
        // sha512 (6) instead of sha256
        let bytes = [6u8, 3, 0, 1, 0xff];
        assert!(matches!(
            DigitallySigned::parse(&bytes),
            Err(SthError::UnsupportedAlgorithm { hash: 6, .. })
        ));
    }

    #[test]
    fn test_json_field_names_match_wire() {
        let sth = SignedTreeHead {
            tree_size: 7,
            timestamp: 1000,
            sha256_root_hash: TreeHash::from([1; 32]),
            tree_head_signature: vec![4, 3, 0, 0],
        };
        let value = serde_json::to_value(&sth).unwrap();
        assert!(value.get("tree_size").is_some());
        assert!(value.get("sha256_root_hash").is_some());
        assert!(value.get("tree_head_signature").is_some());
    }
}
