//! Fetching the log list from its configured source.

use url::Url;

use certwatch_protocol::loglist::LogList;

use crate::{read_capped, ClientError};

/// Loads the log list from `source`: an `http(s)` URL or a local file
/// path.
pub async fn fetch_log_list(
    http: &reqwest::Client,
    source: &str,
) -> Result<LogList, ClientError> {
    match Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => fetch_remote(http, url).await,
        _ => read_local(source).await,
    }
}

async fn fetch_remote(http: &reqwest::Client, url: Url) -> Result<LogList, ClientError> {
    tracing::debug!("fetching log list from `{url}`");

    let response = http.get(url.clone()).send().await.map_err(|source| {
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
        return Err(ClientError::Status {
            url,
            status,
            body: String::from_utf8_lossy(&body).chars().take(200).collect(),
        });
    }

    serde_json::from_slice(&body).map_err(|source| ClientError::Json { url, source })
}

async fn read_local(path: &str) -> Result<LogList, ClientError> {
    tracing::debug!("reading log list from `{path}`");

    // File sources reuse the URL-oriented error kinds so the caller's
    // handling stays uniform; the path stands in for the URL.
    let url = Url::parse(&format!("file:///{}", path.trim_start_matches('/')))
        .unwrap_or_else(|_| Url::parse("file:///log-list").expect("static URL parses"));

    let body = tokio::fs::read(path)
        .await
        .map_err(|e| ClientError::Invalid {
            url: url.clone(),
            reason: e.to_string(),
        })?;

    serde_json::from_slice(&body).map_err(|source| ClientError::Json { url, source })
}
