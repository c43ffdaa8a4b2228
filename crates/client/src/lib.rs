//! HTTP client for the RFC 6962 monitoring endpoints.
//!
//! [`LogClient`] issues the `ct/v1` GETs a monitor needs and decodes
//! their JSON envelopes into the typed structures of
//! `certwatch-protocol`. It is transport only: signatures and Merkle
//! proofs are verified by the caller.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use certwatch_merkle::TreeHash;
use certwatch_protocol::api::{
    GetConsistencyResponse, GetEntriesResponse, GetRootsResponse, GetSthResponse, RawEntry,
};
use certwatch_protocol::SignedTreeHead;

mod loglist;

pub use loglist::fetch_log_list;

/// Fixed User-Agent, so log operators can identify the traffic.
pub const USER_AGENT: &str = concat!("certwatch/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Responses larger than this are cut off rather than buffered; no
/// well-formed envelope from a capped `get-entries` call comes close.
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// How much of an error body to retain for diagnostics.
const ERROR_BODY_SNIPPET: usize = 200;

/// Errors a wire call can produce. The kinds matter to the caller:
/// transport problems and 5xx responses are transient, 4xx and decode
/// failures usually are not.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request to `{url}` failed: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to `{url}` timed out")]
    Timeout { url: Url },

    #[error("`{url}` returned HTTP {status}: {body}")]
    Status {
        url: Url,
        status: StatusCode,
        body: String,
    },

    #[error("`{url}` returned malformed JSON: {source}")]
    Json {
        url: Url,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{url}` response exceeded the {limit} byte cap")]
    BodyTooLarge { url: Url, limit: usize },

    #[error("`{url}` returned an invalid response: {reason}")]
    Invalid { url: Url, reason: String },
}

impl ClientError {
    /// Whether retrying the same request later could plausibly
    /// succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => status.is_server_error(),
            // A malformed body is usually a proxy or deploy glitch;
            // bounded retries are handled by the caller's backoff.
            Self::Json { .. } | Self::BodyTooLarge { .. } | Self::Invalid { .. } => false,
        }
    }

    /// Whether this is an HTTP 4xx response.
    pub fn is_client_status(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status.is_client_error())
    }
}

/// Builds the shared HTTP client every [`LogClient`] hangs off.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// A client for one log's monitoring endpoints.
#[derive(Clone)]
pub struct LogClient {
    http: reqwest::Client,
    base: Url,
}

impl LogClient {
    /// Creates a client for the log at `base`, which must end in a
    /// slash (log list URLs are normalized that way).
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Fetches the log's current signed tree head.
    ///
    /// The numeric fields are checked against the 63-bit domain; the
    /// signature is decoded but *not* verified here.
    pub async fn get_sth(&self) -> Result<SignedTreeHead, ClientError> {
        let url = self.endpoint("ct/v1/get-sth")?;
        let sth: GetSthResponse = self.get_json(url.clone(), &[]).await?;
        sth.validate().map_err(|e| ClientError::Invalid {
            url,
            reason: e.to_string(),
        })?;
        Ok(sth)
    }

    /// Fetches the consistency proof between tree sizes `first` and
    /// `second`.
    pub async fn get_consistency(
        &self,
        first: u64,
        second: u64,
    ) -> Result<Vec<TreeHash>, ClientError> {
        let url = self.endpoint("ct/v1/get-sth-consistency")?;
        let response: GetConsistencyResponse = self
            .get_json(
                url.clone(),
                &[("first", first.to_string()), ("second", second.to_string())],
            )
            .await?;

        response
            .consistency
            .iter()
            .map(|hash| {
                TreeHash::try_from(hash.as_slice()).map_err(|e| ClientError::Invalid {
                    url: url.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Fetches entries `start..=end`.
    ///
    /// Logs may return fewer entries than requested (but never zero
    /// for a valid range without that being an error surfaced to the
    /// caller); callers loop until the range is filled.
    pub async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<RawEntry>, ClientError> {
        let url = self.endpoint("ct/v1/get-entries")?;
        let response: GetEntriesResponse = self
            .get_json(
                url.clone(),
                &[("start", start.to_string()), ("end", end.to_string())],
            )
            .await?;

        let requested = (end - start + 1) as usize;
        if response.entries.len() > requested {
            return Err(ClientError::Invalid {
                url,
                reason: format!(
                    "requested {requested} entries, server returned {}",
                    response.entries.len()
                ),
            });
        }
        Ok(response.entries)
    }

    /// Fetches the log's accepted root certificates.
    pub async fn get_roots(&self) -> Result<Vec<Vec<u8>>, ClientError> {
        let url = self.endpoint("ct/v1/get-roots")?;
        let response: GetRootsResponse = self.get_json(url, &[]).await?;
        Ok(response.certificates)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|e| ClientError::Invalid {
            url: self.base.clone(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        tracing::debug!("GET `{url}` {query:?}");

        let mut request = self.http.get(url.clone());
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await.map_err(|source| {
            if source.is_timeout() {
                ClientError::Timeout { url: url.clone() }
            } else {
                ClientError::Transport {
                    url: url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status();
        let body = read_capped(&url, response).await?;

        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_BODY_SNIPPET)
                .collect();
            return Err(ClientError::Status {
                url,
                status,
                body: snippet,
            });
        }

        serde_json::from_slice(&body).map_err(|source| ClientError::Json { url, source })
    }
}

/// Buffers a response body, aborting once it crosses the size cap.
pub(crate) async fn read_capped(
    url: &Url,
    response: reqwest::Response,
) -> Result<BytesMut, ClientError> {
    if let Some(length) = response.content_length() {
        if length as usize > MAX_RESPONSE_SIZE {
            return Err(ClientError::BodyTooLarge {
                url: url.clone(),
                limit: MAX_RESPONSE_SIZE,
            });
        }
    }

    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| {
            if source.is_timeout() {
                ClientError::Timeout { url: url.clone() }
            } else {
                ClientError::Transport {
                    url: url.clone(),
                    source,
                }
            }
        })?;
        if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
            return Err(ClientError::BodyTooLarge {
                url: url.clone(),
                limit: MAX_RESPONSE_SIZE,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
