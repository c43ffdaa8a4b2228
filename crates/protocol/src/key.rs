use core::fmt;

use p256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use sha2::Sha256;
use signature::Verifier;
use thiserror::Error;

use crate::id::LogId;

/// A log's public key, as declared in the log list.
///
/// RFC 6962 section 2.1.4 permits ECDSA on P-256 and RSA with
/// PKCS#1 v1.5 padding, both over SHA-256.
#[derive(Clone)]
pub enum LogKey {
    EcdsaP256(p256::ecdsa::VerifyingKey),
    RsaPkcs1(rsa::pkcs1v15::VerifyingKey<Sha256>),
}

/// The signature algorithm identifiers of the TLS
/// `SignatureAndHashAlgorithm` structure that RFC 6962 allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Rsa = 1,
    Ecdsa = 3,
}

/// Errors constructing or using a log key.
#[derive(Error, Debug)]
pub enum KeyError {
    /// The DER `SubjectPublicKeyInfo` was not a key type RFC 6962
    /// permits.
    #[error("log key is neither an ECDSA P-256 nor an RSA public key")]
    UnsupportedKey,

    /// The signature's declared algorithm does not match the key.
    #[error("signature algorithm {algorithm:?} does not match the log's {key} key")]
    AlgorithmMismatch {
        algorithm: SignatureAlgorithm,
        key: &'static str,
    },

    /// The signature failed cryptographic verification.
    #[error("signature verification failed: {0}")]
    Verification(#[from] signature::Error),
}

impl LogKey {
    /// Parses a DER-encoded `SubjectPublicKeyInfo`.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(Self::EcdsaP256(key));
        }
        if let Ok(key) = rsa::RsaPublicKey::from_public_key_der(der) {
            return Ok(Self::RsaPkcs1(rsa::pkcs1v15::VerifyingKey::new(key)));
        }
        Err(KeyError::UnsupportedKey)
    }

    /// The id of the log this key belongs to.
    pub fn log_id(spki_der: &[u8]) -> LogId {
        LogId::from_spki(spki_der)
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::EcdsaP256(_) => SignatureAlgorithm::Ecdsa,
            Self::RsaPkcs1(_) => SignatureAlgorithm::Rsa,
        }
    }

    /// Verifies `signature` (DER ECDSA or PKCS#1 v1.5 as `algorithm`
    /// declares) over `message`.
    pub fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), KeyError> {
        match self {
            Self::EcdsaP256(key) => {
                if algorithm != SignatureAlgorithm::Ecdsa {
                    return Err(KeyError::AlgorithmMismatch {
                        algorithm,
                        key: "ECDSA P-256",
                    });
                }
                let signature = p256::ecdsa::Signature::from_der(signature)?;
                key.verify(message, &signature)?;
            }
            Self::RsaPkcs1(key) => {
                if algorithm != SignatureAlgorithm::Rsa {
                    return Err(KeyError::AlgorithmMismatch {
                        algorithm,
                        key: "RSA",
                    });
                }
                let signature = rsa::pkcs1v15::Signature::try_from(signature)?;
                key.verify(message, &signature)?;
            }
        }
        Ok(())
    }
}

impl SignatureAlgorithm {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Rsa),
            3 => Some(Self::Ecdsa),
            _ => None,
        }
    }
}

impl fmt::Debug for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EcdsaP256(_) => f.write_str("LogKey::EcdsaP256"),
            Self::RsaPkcs1(_) => f.write_str("LogKey::RsaPkcs1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use signature::Signer;

    use super::*;

    fn test_key() -> (SigningKey, Vec<u8>) {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let spki = signing
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        (signing, spki)
    }

    #[test]
    fn test_ecdsa_round_trip() {
        let (signing, spki) = test_key();
        let key = LogKey::from_spki_der(&spki).unwrap();
        assert_eq!(key.algorithm(), SignatureAlgorithm::Ecdsa);

        let message = b"tree head";
        let signature: p256::ecdsa::Signature = signing.sign(message);
        let der = signature.to_der();

        key.verify(SignatureAlgorithm::Ecdsa, message, der.as_bytes())
            .unwrap();
        assert!(key
            .verify(SignatureAlgorithm::Ecdsa, b"other message", der.as_bytes())
            .is_err());
        assert!(matches!(
            key.verify(SignatureAlgorithm::Rsa, message, der.as_bytes()),
            Err(KeyError::AlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_garbage_spki() {
        assert!(matches!(
            LogKey::from_spki_der(b"not a key"),
            Err(KeyError::UnsupportedKey)
        ));
    }
}
