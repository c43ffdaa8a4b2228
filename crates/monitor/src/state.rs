//! Persistent per-log state and the storage/notification abstraction
//! the monitor core talks to.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use certwatch_merkle::{CollapsedTree, TreeHash};
use certwatch_protocol::loglist::Log;
use certwatch_protocol::{LogId, SignedTreeHead};

use crate::healthcheck::HealthCheckFailure;

/// A verified download position: a collapsed Merkle tree, or — right
/// after a `start_at_end` bootstrap — a bare `(size, root)` pair whose
/// spine has not been recovered yet.
///
/// A sealed position can report its size and root but cannot be
/// extended; the first consistency proof to a larger tree head
/// rebuilds the spine and unseals it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Position {
    Tree(CollapsedTree),
    Sealed {
        size: u64,
        sha256_root_hash: TreeHash,
    },
}

impl Position {
    pub fn size(&self) -> u64 {
        match self {
            Position::Tree(tree) => tree.size(),
            Position::Sealed { size, .. } => *size,
        }
    }

    pub fn root(&self) -> TreeHash {
        match self {
            Position::Tree(tree) => tree.root(),
            Position::Sealed {
                sha256_root_hash, ..
            } => *sha256_root_hash,
        }
    }

    /// The underlying tree, when the spine is known.
    pub fn tree(&self) -> Option<&CollapsedTree> {
        match self {
            Position::Tree(tree) => Some(tree),
            Position::Sealed { .. } => None,
        }
    }
}

impl From<CollapsedTree> for Position {
    fn from(tree: CollapsedTree) -> Self {
        Position::Tree(tree)
    }
}

/// Everything the monitor persists for one log.
///
/// Invariants at rest: `download_position.size() <=
/// verified_sth.tree_size`, and whenever `verified_position.size() ==
/// verified_sth.tree_size` the roots agree. During a run the download
/// position may lead the verified one in memory; only committed state
/// reaches the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogState {
    pub download_position: Position,
    pub verified_position: Position,
    pub verified_sth: Option<SignedTreeHead>,
    /// Wall clock of the last fully successful polling cycle.
    pub last_success: DateTime<Utc>,
}

impl LogState {
    /// Fresh state that downloads the log from its beginning.
    pub fn empty() -> Self {
        Self {
            download_position: CollapsedTree::new().into(),
            verified_position: CollapsedTree::new().into(),
            verified_sth: None,
            last_success: Utc::now(),
        }
    }

    /// State bootstrapped from a tree head accepted as ground truth:
    /// history before it is never downloaded.
    pub fn sealed_at(sth: &SignedTreeHead) -> Self {
        let position = if sth.tree_size == 0 {
            Position::Tree(CollapsedTree::new())
        } else {
            Position::Sealed {
                size: sth.tree_size,
                sha256_root_hash: sth.sha256_root_hash,
            }
        };
        Self {
            download_position: position.clone(),
            verified_position: position,
            verified_sth: Some(sth.clone()),
            last_success: Utc::now(),
        }
    }
}

/// A single downloaded log entry, identified before any parsing.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log: Arc<Log>,
    pub index: u64,
    pub leaf_hash: TreeHash,
    pub leaf_input: Vec<u8>,
    pub extra_data: Vec<u8>,
}

/// A watched certificate discovered in a log. Emitted once per
/// matching entry per successful commit.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredCert {
    #[serde(skip)]
    pub log: Arc<Log>,
    pub log_id: LogId,
    pub index: u64,
    pub leaf_hash: TreeHash,
    pub is_precert: bool,
    /// Colon-separated hex serial number.
    pub serial: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub issuer: String,
    pub subject: String,
    /// Lowercased DNS identities (SAN dNSNames plus a DNS-shaped CN).
    pub dns_identities: Vec<String>,
    /// Hex SHA-256 of the `SubjectPublicKeyInfo`.
    pub pubkey_sha256: String,
    /// The watch list pattern that matched.
    pub watch_item: String,
    /// Timestamp of the log entry.
    pub entry_timestamp: DateTime<Utc>,
    /// DER certificates: the (pre-)certificate first, then its chain.
    #[serde(skip)]
    pub chain: Vec<Vec<u8>>,
}

/// Storage and notification capabilities the monitor core consumes.
///
/// Implementations must be safe under concurrent use across distinct
/// log ids; the supervisor guarantees a single writer per log id.
/// Cancellation propagates by dropping the returned futures, so
/// implementations should not leave partial writes visible.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Initializes the state. Called before any other method;
    /// idempotent.
    async fn prepare(&self) -> Result<()>;

    /// Initializes per-log state. Called before any other method
    /// taking this log id; idempotent.
    async fn prepare_log(&self, log_id: &LogId) -> Result<()>;

    /// Stores log state for retrieval by `load_log_state`.
    async fn store_log_state(&self, log_id: &LogId, state: &LogState) -> Result<()>;

    /// Loads previously stored log state, or `None` if
    /// `store_log_state` has not been called for this log.
    async fn load_log_state(&self, log_id: &LogId) -> Result<Option<LogState>>;

    /// Stores an observed tree head. A head with the same timestamp
    /// and root hash as an already stored one may be ignored.
    async fn store_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()>;

    /// Loads all stored tree heads, sorted ascending by tree size.
    async fn load_sths(&self, log_id: &LogId) -> Result<Vec<SignedTreeHead>>;

    /// Removes a stored tree head.
    async fn remove_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()>;

    /// Called for every entry matching the watch list.
    async fn notify_cert(&self, cert: &DiscoveredCert) -> Result<()>;

    /// Called when an entry cannot be parsed. The entry's position is
    /// still advanced past.
    async fn notify_malformed_entry(&self, entry: &LogEntry, error: &str) -> Result<()>;

    /// Called when a health check fails. `log` is `None` for failures
    /// not tied to one log.
    async fn notify_health_check_failure(
        &self,
        log: Option<&Log>,
        failure: &HealthCheckFailure,
    ) -> Result<()>;

    /// Called on non-fatal errors. Most are transient and the
    /// operation will be retried.
    async fn notify_error(&self, log: Option<&Log>, error: &str) -> Result<()>;
}
