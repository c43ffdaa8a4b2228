//! The certwatch monitoring core.
//!
//! A [`Config`] names a log list source, a watch list, and a
//! [`StateProvider`]; [`run`] then supervises one monitoring task per
//! usable log. Each task polls signed tree heads, proves them
//! consistent with everything verified before, downloads the new
//! entries, and reports every certificate matching the watch list —
//! persisting enough state through the provider to stop and resume
//! at any point without gaps.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub mod cert;
mod daemon;
pub mod healthcheck;
mod state;
mod supervisor;
mod watchlist;

pub use cert::{decode_entry, CertInfo, DecodedEntry, EntryError};
pub use healthcheck::HealthCheckFailure;
pub use state::{DiscoveredCert, LogEntry, LogState, Position, StateProvider};
pub use watchlist::WatchList;

/// Everything the monitor needs to run.
pub struct Config {
    /// URL or file path of the JSON log list.
    pub log_list_source: String,
    /// Storage and notification backend.
    pub state: Arc<dyn StateProvider>,
    /// DNS name patterns to report matches for.
    pub watch_list: WatchList,
    /// Maximum entries requested per `get-entries` call.
    pub batch_size: u64,
    /// Base delay between polling cycles (jittered).
    pub poll_interval: Duration,
    /// How often the log list is reloaded.
    pub log_list_refresh_interval: Duration,
    /// Logs with no successful cycle for this long trigger a health
    /// check notification.
    pub health_check_interval: Duration,
    /// Skip history: accept each new log's current head as ground
    /// truth instead of downloading from entry zero.
    pub start_at_end: bool,
    /// Verbose operation; the binary maps this to its log level.
    pub verbose: bool,
}

impl Config {
    pub fn new(
        log_list_source: impl Into<String>,
        state: Arc<dyn StateProvider>,
        watch_list: WatchList,
    ) -> Self {
        Self {
            log_list_source: log_list_source.into(),
            state,
            watch_list,
            batch_size: 1000,
            poll_interval: Duration::from_secs(5 * 60),
            log_list_refresh_interval: Duration::from_secs(60 * 60),
            health_check_interval: Duration::from_secs(24 * 60 * 60),
            start_at_end: false,
            verbose: false,
        }
    }
}

/// Runs the monitor until `token` is cancelled.
///
/// Returns early only if the state provider cannot be prepared or the
/// initial log list load fails; every later failure is surfaced
/// through the provider and retried.
pub async fn run(config: Config, token: CancellationToken) -> anyhow::Result<()> {
    supervisor::run(config, token).await
}
