//! The JSON log list schema (v3) and the per-log descriptor the
//! monitor works from.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;
use url::Url;

use crate::id::LogId;
use crate::key::{KeyError, LogKey};

/// The top-level log list document: operators, each running some set
/// of logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogList {
    #[serde(default)]
    pub operators: Vec<Operator>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    #[serde(default)]
    pub email: Vec<String>,
    #[serde(default)]
    pub logs: Vec<LogMetadata>,
}

/// One log's entry in the list, as published.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    #[serde(default)]
    pub description: String,
    #[serde_as(as = "Base64")]
    pub log_id: Vec<u8>,
    /// DER-encoded `SubjectPublicKeyInfo`.
    #[serde_as(as = "Base64")]
    pub key: Vec<u8>,
    pub url: String,
    /// Where submissions go, when distinct from the monitoring URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_url: Option<String>,
    /// Maximum merge delay, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmd: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LogListState>,
}

/// The lifecycle state wrapper: exactly one of the keys is present in
/// a well-formed list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogListState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<StateTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified: Option<StateTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usable: Option<StateTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<StateTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired: Option<StateTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<StateTimestamp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateTimestamp {
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A log's lifecycle state, collapsed from the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Qualified,
    Usable,
    ReadOnly,
    Retired,
    Rejected,
}

/// A validated log descriptor: what a per-log monitor needs to run.
#[derive(Debug, Clone)]
pub struct Log {
    pub id: LogId,
    pub description: String,
    pub operator: String,
    pub url: Url,
    pub submission_url: Url,
    pub key: LogKey,
    /// The DER `SubjectPublicKeyInfo` the key was parsed from.
    pub spki: Vec<u8>,
    pub mmd: Option<u64>,
    pub status: LogStatus,
}

/// A log list entry that could not be turned into a usable
/// descriptor.
#[derive(Error, Debug)]
pub enum LogListError {
    #[error("log `{url}` has an invalid URL")]
    InvalidUrl { url: String },

    #[error("log `{url}` has an unusable key: {source}")]
    InvalidKey {
        url: String,
        #[source]
        source: KeyError,
    },

    /// The published `log_id` is not the hash of the published key, so
    /// one of the two is wrong and state cannot be keyed safely.
    #[error("log `{url}` declares id {declared} but its key hashes to {computed}")]
    IdMismatch {
        url: String,
        declared: String,
        computed: LogId,
    },
}

impl LogListState {
    pub fn status(&self) -> Option<LogStatus> {
        if self.usable.is_some() {
            Some(LogStatus::Usable)
        } else if self.qualified.is_some() {
            Some(LogStatus::Qualified)
        } else if self.readonly.is_some() {
            Some(LogStatus::ReadOnly)
        } else if self.retired.is_some() {
            Some(LogStatus::Retired)
        } else if self.rejected.is_some() {
            Some(LogStatus::Rejected)
        } else if self.pending.is_some() {
            Some(LogStatus::Pending)
        } else {
            None
        }
    }
}

impl LogMetadata {
    /// Validates the entry into a [`Log`] descriptor.
    pub fn resolve(&self, operator: &str) -> Result<Log, LogListError> {
        let url = normalize_url(&self.url).ok_or_else(|| LogListError::InvalidUrl {
            url: self.url.clone(),
        })?;
        let submission_url = match &self.submission_url {
            Some(submission) => {
                normalize_url(submission).ok_or_else(|| LogListError::InvalidUrl {
                    url: submission.clone(),
                })?
            }
            None => url.clone(),
        };

        let key = LogKey::from_spki_der(&self.key).map_err(|source| LogListError::InvalidKey {
            url: self.url.clone(),
            source,
        })?;

        let computed = LogId::from_spki(&self.key);
        if self.log_id.as_slice() != computed.as_bytes().as_slice() {
            return Err(LogListError::IdMismatch {
                url: self.url.clone(),
                declared: base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    &self.log_id,
                ),
                computed,
            });
        }

        Ok(Log {
            id: computed,
            description: self.description.clone(),
            operator: operator.to_string(),
            url,
            submission_url,
            key,
            spki: self.key.clone(),
            mmd: self.mmd,
            status: self
                .state
                .as_ref()
                .and_then(LogListState::status)
                .unwrap_or(LogStatus::Pending),
        })
    }
}

impl LogList {
    /// Resolves every entry, yielding a descriptor or the reason it
    /// was skipped.
    pub fn logs(&self) -> impl Iterator<Item = Result<Log, LogListError>> + '_ {
        self.operators.iter().flat_map(|operator| {
            operator
                .logs
                .iter()
                .map(|metadata| metadata.resolve(&operator.name))
        })
    }
}

/// Parses a log URL, requiring a scheme and forcing the trailing
/// slash `Url::join` needs to keep the path intact.
fn normalize_url(url: &str) -> Option<Url> {
    let mut text = url.to_string();
    if !text.ends_with('/') {
        text.push('/');
    }
    let parsed = Url::parse(&text).ok()?;
    if parsed.cannot_be_a_base() {
        return None;
    }
    Some(parsed)
}
