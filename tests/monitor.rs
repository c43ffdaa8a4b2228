//! End-to-end scenarios: the real supervisor, monitor, client, and
//! Merkle engine against an in-process fake log.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use certwatch_monitor::{Config, WatchList};

use support::{entry_for, wait_for, FakeLog, RecordingState, MATCHING_CERT, OTHER_CERT};

pub mod support;

fn watch_example_com() -> WatchList {
    WatchList::parse("example.com\n")
}

struct Harness {
    log: FakeLog,
    state: Arc<RecordingState>,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        tree_size: u64,
        start_at_end: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log = FakeLog::start(entries, tree_size).await;
        let list_path = log.write_log_list(dir.path());

        let state = Arc::new(RecordingState::default());
        let mut config = Config::new(
            list_path.to_str().unwrap(),
            state.clone(),
            watch_example_com(),
        );
        config.batch_size = 1000;
        config.poll_interval = Duration::from_millis(50);
        config.log_list_refresh_interval = Duration::from_secs(3600);
        config.health_check_interval = Duration::from_secs(3600);
        config.start_at_end = start_at_end;

        let token = CancellationToken::new();
        let handle = tokio::spawn(certwatch_monitor::run(config, token.clone()));

        Harness {
            log,
            state,
            token,
            handle,
            _dir: dir,
        }
    }

    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn plain_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| entry_for(OTHER_CERT, 1_600_000_000_000 + i as u64))
        .collect()
}

// S1: a fresh state against an empty log completes a cycle with no
// certificates and a verified size-zero head.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_bootstrap() {
    let harness = Harness::start(Vec::new(), 0, false).await;
    let log_id = harness.log.log_id;

    wait_for("a verified size-0 head", || {
        harness.state.verified_size(&log_id) == Some(0)
    })
    .await;

    let state = harness.state.snapshot(|r| r.log_states[&log_id].clone());
    assert_eq!(state.verified_position.size(), 0);
    assert_eq!(state.download_position.size(), 0);
    assert!(harness.state.snapshot(|r| r.certs.is_empty()));
    assert!(harness.state.snapshot(|r| r.errors.is_empty()));

    harness.stop().await;
}

// S2: the log grows 0 -> 5 -> 12 and the only matching entry sits at
// index 7; exactly one certificate is discovered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linear_growth() {
    let mut entries = plain_entries(12);
    entries[7] = entry_for(MATCHING_CERT, 1_600_000_000_007);

    let harness = Harness::start(entries, 5, false).await;
    let log_id = harness.log.log_id;

    wait_for("the first five entries to verify", || {
        harness.state.verified_size(&log_id) == Some(5)
    })
    .await;
    assert!(harness.state.snapshot(|r| r.certs.is_empty()));

    harness.log.set_tree_size(12);
    wait_for("all twelve entries to verify", || {
        harness.state.verified_size(&log_id) == Some(12)
    })
    .await;

    let certs = harness.state.snapshot(|r| r.certs.clone());
    assert_eq!(certs.len(), 1, "expected exactly one discovered cert");
    assert_eq!(certs[0].index, 7);
    assert_eq!(certs[0].watch_item, "example.com");
    assert!(certs[0]
        .dns_identities
        .contains(&"foo.example.com".to_string()));
    assert!(!certs[0].is_precert);

    let state = harness.state.snapshot(|r| r.log_states[&log_id].clone());
    assert_eq!(state.verified_position.size(), 12);

    harness.stop().await;
}

// S3: a consistency proof that does not verify halts the log; the
// verified head stays put and no further entries are fetched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistency_violation() {
    let harness = Harness::start(plain_entries(20), 10, false).await;
    let log_id = harness.log.log_id;

    wait_for("the first ten entries to verify", || {
        harness.state.verified_size(&log_id) == Some(10)
    })
    .await;

    harness.log.set_bad_consistency(true);
    harness.log.set_tree_size(20);

    wait_for("the consistency failure to surface", || {
        harness
            .state
            .snapshot(|r| r.errors.iter().any(|e| e.contains("CONSISTENCY FAILURE")))
    })
    .await;

    let calls = harness.log.get_entries_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.state.verified_size(&log_id), Some(10));
    assert_eq!(
        harness.log.get_entries_calls(),
        calls,
        "a halted log must stop fetching entries"
    );

    harness.stop().await;
}

// S4: two signed heads with the same size but different roots are a
// split view and halt the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn split_view() {
    let harness = Harness::start(plain_entries(10), 10, false).await;
    let log_id = harness.log.log_id;

    wait_for("the first ten entries to verify", || {
        harness.state.verified_size(&log_id) == Some(10)
    })
    .await;

    harness
        .log
        .set_split_root(certwatch_merkle::hash_leaf(b"the other view"));

    wait_for("the split view to surface", || {
        harness
            .state
            .snapshot(|r| r.errors.iter().any(|e| e.contains("split view")))
    })
    .await;

    assert_eq!(harness.state.verified_size(&log_id), Some(10));
    harness.stop().await;
}

// S5: an undecodable entry is reported exactly once and the position
// still advances past it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_entry() {
    let mut entries = plain_entries(5);
    entries[3] = (b"\x00\x00garbage that is not a leaf".to_vec(), Vec::new());

    let harness = Harness::start(entries, 5, false).await;
    let log_id = harness.log.log_id;

    wait_for("all five entries to verify", || {
        harness.state.verified_size(&log_id) == Some(5)
    })
    .await;

    // Let a couple more polling cycles pass to prove the report is
    // not repeated.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let malformed = harness.state.snapshot(|r| r.malformed.clone());
    assert_eq!(malformed.len(), 1, "exactly one malformed-entry report");
    assert_eq!(malformed[0].0, 3);
    assert!(harness.state.snapshot(|r| r.certs.is_empty()));

    let state = harness.state.snapshot(|r| r.log_states[&log_id].clone());
    assert_eq!(state.verified_position.size(), 5);

    harness.stop().await;
}

// S6: with start_at_end the monitor skips history entirely, then
// matches only against entries appended afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_at_end() {
    let mut entries = plain_entries(1005);
    // Historical matches that must NOT be reported.
    entries[5] = entry_for(MATCHING_CERT, 1_600_000_000_005);
    entries[500] = entry_for(MATCHING_CERT, 1_600_000_000_500);
    // The one post-bootstrap match.
    entries[1002] = entry_for(MATCHING_CERT, 1_600_000_001_002);

    let harness = Harness::start(entries, 1000, true).await;
    let log_id = harness.log.log_id;

    wait_for("the bootstrap head to persist", || {
        harness.state.verified_size(&log_id) == Some(1000)
    })
    .await;
    assert_eq!(
        harness.log.get_entries_calls(),
        0,
        "start_at_end must not download history"
    );

    harness.log.set_tree_size(1005);
    wait_for("the appended entries to verify", || {
        harness.state.verified_size(&log_id) == Some(1005)
    })
    .await;

    let certs = harness.state.snapshot(|r| r.certs.clone());
    assert_eq!(certs.len(), 1, "only the post-bootstrap match is reported");
    assert_eq!(certs[0].index, 1002);

    let state = harness.state.snapshot(|r| r.log_states[&log_id].clone());
    assert_eq!(state.verified_position.size(), 1005);
    // The commit already proved the rebuilt spine: the root the
    // monitor computed from proof hashes plus five appended leaves
    // matched the signed head.
    assert!(state.verified_position.tree().is_some(), "spine unsealed");

    harness.stop().await;
}
