//! Decoding of the `MerkleTreeLeaf` structure and the accompanying
//! `extra_data` chains (RFC 6962 sections 3.4 and 4.6).

use certwatch_merkle::{hash_leaf, TreeHash};

use crate::tls::{DecodeError, Reader};

/// `MerkleLeafType.timestamped_entry`.
const LEAF_TYPE_TIMESTAMPED_ENTRY: u8 = 0;

/// `LogEntryType` values.
const ENTRY_TYPE_X509: u16 = 0;
const ENTRY_TYPE_PRECERT: u16 = 1;

/// A decoded `MerkleTreeLeaf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTreeLeaf {
    pub version: u8,
    pub entry: TimestampedEntry,
}

/// The `TimestampedEntry` a v1 leaf carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: EntryKind,
    /// Raw `CtExtensions` bytes; empty for every log in practice.
    pub extensions: Vec<u8>,
}

/// The certificate payload of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A final certificate; the bytes are a DER `Certificate`.
    X509 { certificate: Vec<u8> },
    /// A pre-certificate: the hash of the issuer's public key plus the
    /// DER `TBSCertificate` with the poison extension removed.
    Precert {
        issuer_key_hash: [u8; 32],
        tbs_certificate: Vec<u8>,
    },
}

/// The decoded `extra_data` of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraData {
    /// `X509ChainEntry`: the issuer chain of a final certificate.
    X509Chain { chain: Vec<Vec<u8>> },
    /// `PrecertChainEntry`: the submitted pre-certificate and its
    /// chain.
    PrecertChain {
        pre_certificate: Vec<u8>,
        chain: Vec<Vec<u8>>,
    },
}

impl MerkleTreeLeaf {
    /// Decodes the structure from the `leaf_input` bytes of a
    /// `get-entries` response.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8("leaf version")?;
        let leaf_type = reader.u8("leaf type")?;
        if leaf_type != LEAF_TYPE_TIMESTAMPED_ENTRY {
            return Err(DecodeError::Unsupported {
                field: "leaf type",
                value: leaf_type.into(),
            });
        }

        let timestamp = reader.u64("entry timestamp")?;
        let entry_type = reader.u16("entry type")?;
        let kind = match entry_type {
            ENTRY_TYPE_X509 => EntryKind::X509 {
                certificate: reader.opaque_u24("certificate")?.to_vec(),
            },
            ENTRY_TYPE_PRECERT => {
                let issuer_key_hash = reader
                    .take(32, "issuer key hash")?
                    .try_into()
                    .expect("take returns exactly 32 bytes");
                EntryKind::Precert {
                    issuer_key_hash,
                    tbs_certificate: reader.opaque_u24("tbs certificate")?.to_vec(),
                }
            }
            other => {
                return Err(DecodeError::Unsupported {
                    field: "entry type",
                    value: other.into(),
                })
            }
        };
        let extensions = reader.opaque_u16("extensions")?.to_vec();
        reader.finish()?;

        Ok(Self {
            version,
            entry: TimestampedEntry {
                timestamp,
                kind,
                extensions,
            },
        })
    }

    /// Encodes the leaf back to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.version);
        bytes.push(LEAF_TYPE_TIMESTAMPED_ENTRY);
        bytes.extend_from_slice(&self.entry.timestamp.to_be_bytes());
        match &self.entry.kind {
            EntryKind::X509 { certificate } => {
                bytes.extend_from_slice(&ENTRY_TYPE_X509.to_be_bytes());
                push_u24(&mut bytes, certificate);
            }
            EntryKind::Precert {
                issuer_key_hash,
                tbs_certificate,
            } => {
                bytes.extend_from_slice(&ENTRY_TYPE_PRECERT.to_be_bytes());
                bytes.extend_from_slice(issuer_key_hash);
                push_u24(&mut bytes, tbs_certificate);
            }
        }
        bytes.extend_from_slice(&(self.entry.extensions.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.entry.extensions);
        bytes
    }
}

impl ExtraData {
    /// Decodes `extra_data` bytes; the expected shape depends on the
    /// leaf's entry kind.
    pub fn parse(kind: &EntryKind, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let data = match kind {
            EntryKind::X509 { .. } => ExtraData::X509Chain {
                chain: parse_chain(&mut reader)?,
            },
            EntryKind::Precert { .. } => ExtraData::PrecertChain {
                pre_certificate: reader.opaque_u24("pre-certificate")?.to_vec(),
                chain: parse_chain(&mut reader)?,
            },
        };
        reader.finish()?;
        Ok(data)
    }

    /// The issuer chain, excluding any pre-certificate.
    pub fn chain(&self) -> &[Vec<u8>] {
        match self {
            ExtraData::X509Chain { chain } => chain,
            ExtraData::PrecertChain { chain, .. } => chain,
        }
    }
}

/// An `ASN.1Cert chain<0..2^24-1>` list of certificates.
fn parse_chain(reader: &mut Reader<'_>) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut list = Reader::new(reader.opaque_u24("certificate chain")?);
    let mut chain = Vec::new();
    while !list.is_empty() {
        chain.push(list.opaque_u24("chain certificate")?.to_vec());
    }
    Ok(chain)
}

fn push_u24(bytes: &mut Vec<u8>, data: &[u8]) {
    let len = (data.len() as u32).to_be_bytes();
    bytes.extend_from_slice(&len[1..]);
    bytes.extend_from_slice(data);
}

/// Encodes the `extra_data` of an entry; the inverse of
/// [`ExtraData::parse`].
pub fn encode_extra_data(data: &ExtraData) -> Vec<u8> {
    fn encode_chain(bytes: &mut Vec<u8>, chain: &[Vec<u8>]) {
        let total: usize = chain.iter().map(|c| 3 + c.len()).sum();
        let len = (total as u32).to_be_bytes();
        bytes.extend_from_slice(&len[1..]);
        for certificate in chain {
            push_u24(bytes, certificate);
        }
    }

    let mut bytes = Vec::new();
    match data {
        ExtraData::X509Chain { chain } => encode_chain(&mut bytes, chain),
        ExtraData::PrecertChain {
            pre_certificate,
            chain,
        } => {
            push_u24(&mut bytes, pre_certificate);
            encode_chain(&mut bytes, chain);
        }
    }
    bytes
}

/// The Merkle leaf hash of an entry, computed over the raw leaf bytes
/// before any parsing: a malformed leaf still has a well-defined
/// position in the tree.
pub fn leaf_hash(leaf_input: &[u8]) -> TreeHash {
    hash_leaf(leaf_input)
}
