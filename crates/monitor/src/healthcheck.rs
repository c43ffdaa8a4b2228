//! Health checks: detecting logs (or the log list) that have silently
//! stopped making progress.

use chrono::{DateTime, Utc};
use serde_json::json;

use certwatch_protocol::loglist::Log;
use certwatch_protocol::SignedTreeHead;

use crate::state::StateProvider;

/// A failed health check. Each variant carries its own evidence; the
/// summary, text and JSON renderings are projections of it.
#[derive(Debug, Clone)]
pub enum HealthCheckFailure {
    /// No fresh tree head has been observed within the interval: the
    /// log has been unreachable or unresponsive.
    StaleSth {
        log_url: String,
        last_success: DateTime<Utc>,
        latest_sth: Option<SignedTreeHead>,
    },

    /// Fresh tree heads exist but the download position trails them:
    /// entries are not coming down fast enough.
    Backlog {
        log_url: String,
        latest_sth: SignedTreeHead,
        position: u64,
    },

    /// The log list itself has not refreshed within the interval.
    StaleLogList {
        source: String,
        last_success: DateTime<Utc>,
        last_error: String,
        last_error_time: DateTime<Utc>,
    },
}

impl HealthCheckFailure {
    /// Entries known to exist but not yet downloaded.
    pub fn backlog(&self) -> u64 {
        match self {
            Self::Backlog {
                latest_sth,
                position,
                ..
            } => latest_sth.tree_size.saturating_sub(*position),
            _ => 0,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::StaleSth {
                log_url,
                last_success,
                ..
            } => format!("Unable to contact {log_url} since {last_success}"),
            Self::Backlog { log_url, .. } => {
                format!("Backlog of size {} from {log_url}", self.backlog())
            }
            Self::StaleLogList { last_success, .. } => {
                format!("Unable to retrieve log list since {last_success}")
            }
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::StaleSth {
                log_url,
                last_success,
                latest_sth,
            } => {
                let mut text = format!(
                    "certwatch has been unable to contact {log_url} since {last_success}. \
                     Consequently, certwatch may fail to notify you about certificates in \
                     this log.\n\n",
                );
                match latest_sth {
                    Some(sth) => text.push_str(&format!(
                        "Latest known log size = {} (as of {})\n",
                        sth.tree_size,
                        sth.timestamp_time(),
                    )),
                    None => text.push_str("Latest known log size = none\n"),
                }
                text
            }
            Self::Backlog {
                log_url,
                latest_sth,
                position,
            } => format!(
                "certwatch has been unable to download entries from {log_url} in a timely \
                 manner. Consequently, certwatch may be slow to notify you about \
                 certificates in this log.\n\n\
                 Current log size = {} (as of {})\n\
                 Current position = {position}\n\
                 \x20        Backlog = {}\n",
                latest_sth.tree_size,
                latest_sth.timestamp_time(),
                self.backlog(),
            ),
            Self::StaleLogList {
                source,
                last_success,
                last_error,
                last_error_time,
            } => format!(
                "certwatch has been unable to retrieve the log list from {source} since \
                 {last_success}.\n\n\
                 Last error (at {last_error_time}): {last_error}\n\n\
                 Consequently, certwatch may not be monitoring all logs, and might fail to \
                 detect certificates.\n",
            ),
        }
    }

    pub fn json(&self) -> serde_json::Value {
        match self {
            Self::StaleSth {
                log_url,
                last_success,
                ..
            } => json!({
                "kind": "stale_sth",
                "log_url": log_url,
                "last_success": last_success.to_rfc3339(),
            }),
            Self::Backlog {
                log_url,
                latest_sth,
                position,
            } => json!({
                "kind": "backlog",
                "log_url": log_url,
                "tree_size": latest_sth.tree_size,
                "position": position,
                "backlog": self.backlog(),
            }),
            Self::StaleLogList {
                source,
                last_success,
                last_error,
                ..
            } => json!({
                "kind": "stale_log_list",
                "source": source,
                "last_success": last_success.to_rfc3339(),
                "last_error": last_error,
            }),
        }
    }
}

/// Checks one log's progress and reports a failure when
/// `last_success` is older than the health check interval.
pub(crate) async fn check_log(
    state: &dyn StateProvider,
    log: &Log,
    interval: chrono::Duration,
) -> anyhow::Result<()> {
    let Some(log_state) = state.load_log_state(&log.id).await? else {
        return Ok(());
    };

    if Utc::now() - log_state.last_success < interval {
        return Ok(());
    }

    let sths = state.load_sths(&log.id).await?;
    let failure = match sths.last() {
        // Fresh heads were seen but not verified and drained.
        Some(latest) => HealthCheckFailure::Backlog {
            log_url: log.url.to_string(),
            latest_sth: latest.clone(),
            position: log_state.download_position.size(),
        },
        None => HealthCheckFailure::StaleSth {
            log_url: log.url.to_string(),
            last_success: log_state.last_success,
            latest_sth: log_state.verified_sth.clone(),
        },
    };

    state.notify_health_check_failure(Some(log), &failure).await
}
