//! Entry decoding: from raw leaf bytes to the certificate identities
//! the watch list is matched against.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::*;

use certwatch_merkle::TreeHash;
use certwatch_protocol::leaf::{leaf_hash, EntryKind, ExtraData, MerkleTreeLeaf};
use certwatch_protocol::tls;

use crate::watchlist::normalize;

/// Identity material extracted from a certificate or a
/// pre-certificate TBS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Colon-separated hex serial number.
    pub serial: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub issuer: String,
    pub subject: String,
    /// Lowercased, normalized DNS identities: every SAN dNSName plus
    /// the subject CN when it is shaped like a DNS name.
    pub dns_identities: Vec<String>,
    /// Hex SHA-256 of the DER `SubjectPublicKeyInfo`.
    pub pubkey_sha256: String,
}

/// A fully decoded log entry.
#[derive(Debug, Clone)]
pub struct DecodedEntry {
    pub leaf_hash: TreeHash,
    /// Timestamp the log assigned to the entry.
    pub timestamp: DateTime<Utc>,
    pub is_precert: bool,
    pub info: CertInfo,
    /// DER certificates: the (pre-)certificate first, then its chain.
    pub chain: Vec<Vec<u8>>,
}

/// Why an entry could not be decoded. Decoding failures are
/// per-entry: the monitor reports them and moves on, because the
/// entry's leaf hash is computed from the raw bytes and the position
/// advances regardless.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("malformed leaf: {0}")]
    Leaf(#[from] tls::DecodeError),

    #[error("malformed certificate: {0}")]
    Certificate(String),
}

/// Decodes one raw entry into its certificate identities.
///
/// The extra data is best-effort: a chain that fails to decode leaves
/// the chain empty rather than failing the entry, since identity
/// extraction only needs the leaf.
pub fn decode_entry(leaf_input: &[u8], extra_data: &[u8]) -> Result<DecodedEntry, EntryError> {
    let leaf = MerkleTreeLeaf::parse(leaf_input)?;

    let (info, is_precert) = match &leaf.entry.kind {
        EntryKind::X509 { certificate } => {
            let (_, parsed) = X509Certificate::from_der(certificate)
                .map_err(|e| EntryError::Certificate(e.to_string()))?;
            (extract(&parsed.tbs_certificate), false)
        }
        EntryKind::Precert {
            tbs_certificate, ..
        } => {
            let (_, parsed) = TbsCertificate::from_der(tbs_certificate)
                .map_err(|e| EntryError::Certificate(e.to_string()))?;
            (extract(&parsed), true)
        }
    };

    let chain = match ExtraData::parse(&leaf.entry.kind, extra_data) {
        Ok(data) => {
            let mut chain = Vec::new();
            match (&leaf.entry.kind, &data) {
                (EntryKind::X509 { certificate }, _) => chain.push(certificate.clone()),
                (_, ExtraData::PrecertChain {
                    pre_certificate, ..
                }) => chain.push(pre_certificate.clone()),
                _ => {}
            }
            chain.extend_from_slice(data.chain());
            chain
        }
        Err(error) => {
            tracing::debug!("ignoring undecodable extra data: {error}");
            match &leaf.entry.kind {
                EntryKind::X509 { certificate } => vec![certificate.clone()],
                EntryKind::Precert { .. } => Vec::new(),
            }
        }
    };

    Ok(DecodedEntry {
        leaf_hash: leaf_hash(leaf_input),
        timestamp: millis_to_datetime(leaf.entry.timestamp),
        is_precert,
        info,
        chain,
    })
}

fn extract(tbs: &TbsCertificate<'_>) -> CertInfo {
    let mut dns_identities: Vec<String> = Vec::new();

    if let Ok(Some(san)) = tbs.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                push_unique(&mut dns_identities, normalize(dns));
            }
        }
    }

    for attribute in tbs.subject.iter_common_name() {
        if let Ok(cn) = attribute.as_str() {
            if dns_shaped(cn) {
                push_unique(&mut dns_identities, normalize(cn));
            }
        }
    }

    CertInfo {
        serial: tbs.raw_serial_as_string(),
        not_before: seconds_to_datetime(tbs.validity.not_before.timestamp()),
        not_after: seconds_to_datetime(tbs.validity.not_after.timestamp()),
        issuer: tbs.issuer.to_string(),
        subject: tbs.subject.to_string(),
        dns_identities,
        pubkey_sha256: hex(&Sha256::digest(tbs.subject_pki.raw)),
    }
}

fn push_unique(identities: &mut Vec<String>, identity: String) {
    if !identity.is_empty() && !identities.contains(&identity) {
        identities.push(identity);
    }
}

/// Whether a common name is plausibly a DNS name rather than a
/// human-readable description.
fn dns_shaped(name: &str) -> bool {
    !name.is_empty()
        && name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*' | '_'))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn seconds_to_datetime(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis.min(i64::MAX as u64) as i64)
        .single()
        .unwrap_or_default()
}
