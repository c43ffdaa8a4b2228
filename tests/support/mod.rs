//! Shared machinery for the end-to-end scenarios: an in-process fake
//! CT log, a recording state provider, and a reference Merkle tree
//! for proof generation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePublicKey;
use signature::Signer;
use tokio::task::JoinHandle;

use certwatch_merkle::{hash_branch, hash_empty, hash_leaf, TreeHash};
use certwatch_monitor::healthcheck::HealthCheckFailure;
use certwatch_monitor::{DiscoveredCert, LogEntry, LogState, StateProvider};
use certwatch_protocol::leaf::{EntryKind, MerkleTreeLeaf, TimestampedEntry};
use certwatch_protocol::loglist::{Log, LogMetadata};
use certwatch_protocol::{DigitallySigned, LogId, SignedTreeHead, SignatureAlgorithm};

/// A certificate with SANs `foo.example.com` and `bar.example.com`.
pub const MATCHING_CERT: &[u8] = include_bytes!("../testdata/cert.der");
/// A certificate with SANs under `unrelated.invalid`.
pub const OTHER_CERT: &[u8] = include_bytes!("../testdata/other.der");

// ---------------------------------------------------------------
// Reference Merkle tree (RFC 6962 section 2.1), used to compute the
// fake log's roots and proofs independently of the crate under test.

pub fn tree_hash(leaves: &[Vec<u8>]) -> TreeHash {
    match leaves.len() {
        0 => hash_empty(),
        1 => hash_leaf(&leaves[0]),
        n => {
            let k = n.next_power_of_two() / 2;
            hash_branch(&tree_hash(&leaves[..k]), &tree_hash(&leaves[k..]))
        }
    }
}

pub fn consistency_proof(leaves: &[Vec<u8>], old_size: usize) -> Vec<TreeHash> {
    assert!(0 < old_size && old_size <= leaves.len());
    subproof(old_size, leaves, true)
}

fn subproof(m: usize, leaves: &[Vec<u8>], complete: bool) -> Vec<TreeHash> {
    let n = leaves.len();
    if m == n {
        if complete {
            return Vec::new();
        }
        return vec![tree_hash(leaves)];
    }
    let k = n.next_power_of_two() / 2;
    if m <= k {
        let mut proof = subproof(m, &leaves[..k], complete);
        proof.push(tree_hash(&leaves[k..]));
        proof
    } else {
        let mut proof = subproof(m - k, &leaves[k..], false);
        proof.push(tree_hash(&leaves[..k]));
        proof
    }
}

// ---------------------------------------------------------------
// Fake log

/// Builds a `leaf_input`/`extra_data` pair for an x509 entry carrying
/// the given DER certificate.
pub fn entry_for(certificate: &[u8], timestamp: u64) -> (Vec<u8>, Vec<u8>) {
    let leaf = MerkleTreeLeaf {
        version: 0,
        entry: TimestampedEntry {
            timestamp,
            kind: EntryKind::X509 {
                certificate: certificate.to_vec(),
            },
            extensions: Vec::new(),
        },
    };
    // Empty issuer chain.
    (leaf.encode(), vec![0, 0, 0])
}

struct FakeLogInner {
    signing: SigningKey,
    entries: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Published tree size; at most `entries.len()`.
    tree_size: AtomicU64,
    /// Overrides the signed root to fabricate a split view.
    split_root: Mutex<Option<TreeHash>>,
    /// Tamper with consistency proofs.
    bad_consistency: std::sync::atomic::AtomicBool,
    timestamp: AtomicU64,
    get_entries_calls: AtomicUsize,
    /// Entries served per get-entries call; exercises partial
    /// responses.
    max_per_call: usize,
}

/// An in-process CT log serving the four monitoring endpoints with
/// real signatures and (normally) real proofs.
pub struct FakeLog {
    inner: Arc<FakeLogInner>,
    pub url: String,
    pub log_id: LogId,
    pub spki: Vec<u8>,
    _server: JoinHandle<()>,
}

impl FakeLog {
    pub async fn start(entries: Vec<(Vec<u8>, Vec<u8>)>, tree_size: u64) -> Self {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let spki = signing
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        let log_id = LogId::from_spki(&spki);

        let inner = Arc::new(FakeLogInner {
            signing,
            entries: Mutex::new(entries),
            tree_size: AtomicU64::new(tree_size),
            split_root: Mutex::new(None),
            bad_consistency: std::sync::atomic::AtomicBool::new(false),
            timestamp: AtomicU64::new(1_700_000_000_000),
            get_entries_calls: AtomicUsize::new(0),
            max_per_call: 4,
        });

        let router = Router::new()
            .route("/ct/v1/get-sth", get(get_sth))
            .route("/ct/v1/get-sth-consistency", get(get_consistency))
            .route("/ct/v1/get-entries", get(get_entries))
            .route("/ct/v1/get-roots", get(get_roots))
            .with_state(inner.clone());

        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(router.into_make_service());
        let url = format!("http://{}/", server.local_addr());
        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            inner,
            url,
            log_id,
            spki,
            _server: handle,
        }
    }

    pub fn set_tree_size(&self, size: u64) {
        self.inner.tree_size.store(size, Ordering::SeqCst);
    }

    pub fn push_entries(&self, entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) {
        self.inner.entries.lock().unwrap().extend(entries);
    }

    pub fn set_split_root(&self, root: TreeHash) {
        *self.inner.split_root.lock().unwrap() = Some(root);
    }

    pub fn set_bad_consistency(&self, bad: bool) {
        self.inner.bad_consistency.store(bad, Ordering::SeqCst);
    }

    pub fn get_entries_calls(&self) -> usize {
        self.inner.get_entries_calls.load(Ordering::SeqCst)
    }

    /// Writes a log list naming only this log and returns its path.
    pub fn write_log_list(&self, dir: &std::path::Path) -> std::path::PathBuf {
        let metadata = LogMetadata {
            description: "Fake log".to_string(),
            log_id: self.log_id.as_bytes().to_vec(),
            key: self.spki.clone(),
            url: self.url.clone(),
            submission_url: None,
            mmd: Some(86400),
            state: Some(serde_json::from_value(serde_json::json!({"usable": {}})).unwrap()),
        };
        let list = serde_json::json!({
            "operators": [{"name": "Fake Operator", "logs": [metadata]}]
        });
        let path = dir.join("log_list.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&list).unwrap()).unwrap();
        path
    }

}

impl FakeLogInner {
    fn leaves(&self, size: u64) -> Vec<Vec<u8>> {
        self.entries.lock().unwrap()[..size as usize]
            .iter()
            .map(|(leaf, _)| leaf.clone())
            .collect()
    }

    fn signed_head(&self) -> SignedTreeHead {
        let size = self.tree_size.load(Ordering::SeqCst);
        let root = match *self.split_root.lock().unwrap() {
            Some(root) => root,
            None => tree_hash(&self.leaves(size)),
        };
        let timestamp = self.timestamp.fetch_add(1, Ordering::SeqCst);

        let mut sth = SignedTreeHead {
            tree_size: size,
            timestamp,
            sha256_root_hash: root,
            tree_head_signature: Vec::new(),
        };
        let signature: p256::ecdsa::Signature = self.signing.sign(&sth.signed_message());
        sth.tree_head_signature = DigitallySigned {
            algorithm: SignatureAlgorithm::Ecdsa,
            signature: signature.to_der().as_bytes().to_vec(),
        }
        .encode();
        sth
    }
}

async fn get_sth(State(inner): State<Arc<FakeLogInner>>) -> Json<SignedTreeHead> {
    Json(inner.signed_head())
}

async fn get_consistency(
    State(inner): State<Arc<FakeLogInner>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let first: u64 = params
        .get("first")
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let second: u64 = params
        .get("second")
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let mut proof = if first == 0 || first == second {
        Vec::new()
    } else {
        let leaves = inner.leaves(second);
        consistency_proof(&leaves, first as usize)
    };

    if inner.bad_consistency.load(Ordering::SeqCst) {
        if proof.is_empty() {
            proof.push(hash_leaf(b"bogus"));
        } else {
            proof[0] = hash_leaf(b"tampered");
        }
    }

    let encoded: Vec<String> = proof
        .iter()
        .map(|hash| STANDARD.encode(hash.as_bytes()))
        .collect();
    Ok(Json(serde_json::json!({ "consistency": encoded })))
}

async fn get_entries(
    State(inner): State<Arc<FakeLogInner>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    inner.get_entries_calls.fetch_add(1, Ordering::SeqCst);

    let start: u64 = params
        .get("start")
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let end: u64 = params
        .get("end")
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let size = inner.tree_size.load(Ordering::SeqCst);
    if start >= size || start > end {
        return Err(StatusCode::BAD_REQUEST);
    }

    let end = end.min(size - 1);
    let entries = inner.entries.lock().unwrap();
    let served: Vec<serde_json::Value> = entries[start as usize..=end as usize]
        .iter()
        .take(inner.max_per_call)
        .map(|(leaf, extra)| {
            serde_json::json!({
                "leaf_input": STANDARD.encode(leaf),
                "extra_data": STANDARD.encode(extra),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "entries": served })))
}

async fn get_roots(State(_inner): State<Arc<FakeLogInner>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "certificates": [] }))
}

// ---------------------------------------------------------------
// Recording state provider

#[derive(Default)]
pub struct Recorded {
    pub log_states: HashMap<LogId, LogState>,
    pub sths: HashMap<LogId, Vec<SignedTreeHead>>,
    pub certs: Vec<DiscoveredCert>,
    pub malformed: Vec<(u64, String)>,
    pub health_failures: Vec<String>,
    pub errors: Vec<String>,
}

/// An in-memory `StateProvider` that records everything for
/// assertions.
#[derive(Default)]
pub struct RecordingState {
    inner: Mutex<Recorded>,
}

impl RecordingState {
    pub fn snapshot<T>(&self, read: impl FnOnce(&Recorded) -> T) -> T {
        read(&self.inner.lock().unwrap())
    }

    pub fn verified_size(&self, log_id: &LogId) -> Option<u64> {
        self.snapshot(|recorded| {
            recorded
                .log_states
                .get(log_id)
                .and_then(|state| state.verified_sth.as_ref())
                .map(|sth| sth.tree_size)
        })
    }
}

#[async_trait]
impl StateProvider for RecordingState {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare_log(&self, _log_id: &LogId) -> Result<()> {
        Ok(())
    }

    async fn store_log_state(&self, log_id: &LogId, state: &LogState) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .log_states
            .insert(*log_id, state.clone());
        Ok(())
    }

    async fn load_log_state(&self, log_id: &LogId) -> Result<Option<LogState>> {
        Ok(self.inner.lock().unwrap().log_states.get(log_id).cloned())
    }

    async fn store_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let sths = inner.sths.entry(*log_id).or_default();
        if !sths.iter().any(|existing| {
            existing.timestamp == sth.timestamp
                && existing.sha256_root_hash == sth.sha256_root_hash
        }) {
            sths.push(sth.clone());
        }
        Ok(())
    }

    async fn load_sths(&self, log_id: &LogId) -> Result<Vec<SignedTreeHead>> {
        let mut sths = self
            .inner
            .lock()
            .unwrap()
            .sths
            .get(log_id)
            .cloned()
            .unwrap_or_default();
        sths.sort_by_key(|sth| (sth.tree_size, sth.timestamp));
        Ok(sths)
    }

    async fn remove_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()> {
        if let Some(sths) = self.inner.lock().unwrap().sths.get_mut(log_id) {
            sths.retain(|existing| {
                !(existing.timestamp == sth.timestamp
                    && existing.sha256_root_hash == sth.sha256_root_hash)
            });
        }
        Ok(())
    }

    async fn notify_cert(&self, cert: &DiscoveredCert) -> Result<()> {
        self.inner.lock().unwrap().certs.push(cert.clone());
        Ok(())
    }

    async fn notify_malformed_entry(&self, entry: &LogEntry, error: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .malformed
            .push((entry.index, error.to_string()));
        Ok(())
    }

    async fn notify_health_check_failure(
        &self,
        _log: Option<&Log>,
        failure: &HealthCheckFailure,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .health_failures
            .push(failure.summary());
        Ok(())
    }

    async fn notify_error(&self, _log: Option<&Log>, error: &str) -> Result<()> {
        self.inner.lock().unwrap().errors.push(error.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}
