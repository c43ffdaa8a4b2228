//! The per-log monitor: polls tree heads, verifies consistency,
//! downloads entries, matches them against the watch list, and
//! advances the verified position.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use certwatch_client::{ClientError, LogClient};
use certwatch_merkle::{verify_consistency, CollapsedTree};
use certwatch_protocol::loglist::Log;
use certwatch_protocol::SignedTreeHead;

use crate::cert::decode_entry;
use crate::state::{DiscoveredCert, LogEntry, LogState, Position};
use crate::Config;

/// Consecutive empty `get-entries` responses tolerated for a
/// non-empty range before the cycle gives up and reports.
const EMPTY_RETRY_LIMIT: u32 = 5;

/// Backoff doubles up to `1 << BACKOFF_CAP_EXP` seconds.
const BACKOFF_CAP_EXP: u32 = 9;

/// After this many consecutive failures of the same kind the poll
/// interval is stretched by `CIRCUIT_FACTOR` until a success.
const CIRCUIT_THRESHOLD: u32 = 5;
const CIRCUIT_FACTOR: u32 = 8;

/// How a polling cycle ended, beyond plain success.
enum CycleError {
    /// The cancellation token fired; return without reporting.
    Cancelled,
    /// An integrity violation: the log is halted until an operator
    /// intervenes. Already reported when constructed.
    Fatal,
    /// A recoverable failure; retried with backoff. The kind feeds
    /// the per-log circuit breaker.
    Transient {
        kind: &'static str,
        message: String,
    },
    /// Nothing actionable right now (entries not yet served for a
    /// fresh head); try again next poll without counting a failure.
    Defer,
}

struct Daemon {
    config: Arc<Config>,
    log: Arc<Log>,
    client: LogClient,
    state: LogState,
    failures: u32,
    failure_kind: Option<&'static str>,
}

/// Runs the monitor for one log until cancellation. Never returns an
/// error: failures are surfaced through the state provider.
pub(crate) async fn run_log(
    config: Arc<Config>,
    log: Arc<Log>,
    client: LogClient,
    token: CancellationToken,
) {
    let state = match bootstrap(&config, &log, &client, &token).await {
        Some(state) => state,
        None => return,
    };

    let mut daemon = Daemon {
        config,
        log,
        client,
        state,
        failures: 0,
        failure_kind: None,
    };

    loop {
        match daemon.cycle(&token).await {
            Ok(()) => {
                daemon.failures = 0;
                daemon.failure_kind = None;
                if !daemon.sleep(&token, daemon.poll_delay()).await {
                    return;
                }
            }
            Err(CycleError::Cancelled) => return,
            Err(CycleError::Fatal) => {
                // Halted: no further work for this log.
                token.cancelled().await;
                return;
            }
            Err(CycleError::Defer) => {
                if !daemon.sleep(&token, daemon.poll_delay()).await {
                    return;
                }
            }
            Err(CycleError::Transient { kind, message }) => {
                daemon.note_failure(kind);
                if let Err(e) = daemon
                    .config
                    .state
                    .notify_error(Some(&daemon.log), &message)
                    .await
                {
                    tracing::warn!("failed to report error for {}: {e}", daemon.log.url);
                }
                let delay = backoff_delay(daemon.failures);
                tracing::debug!(
                    "{}: retrying in {delay:?} after failure #{}",
                    daemon.log.url,
                    daemon.failures,
                );
                if !daemon.sleep(&token, delay).await {
                    return;
                }
            }
        }
    }
}

/// Loads persisted state, or initializes it on first contact.
async fn bootstrap(
    config: &Arc<Config>,
    log: &Arc<Log>,
    client: &LogClient,
    token: &CancellationToken,
) -> Option<LogState> {
    let mut attempt: u32 = 0;
    loop {
        match try_bootstrap(config, log, client, token).await {
            Ok(state) => return Some(state),
            Err(CycleError::Cancelled) => return None,
            Err(CycleError::Fatal) => {
                token.cancelled().await;
                return None;
            }
            Err(CycleError::Defer) => {}
            Err(CycleError::Transient { message, .. }) => {
                if let Err(e) = config.state.notify_error(Some(log), &message).await {
                    tracing::warn!("failed to report error for {}: {e}", log.url);
                }
            }
        }
        attempt += 1;
        let delay = backoff_delay(attempt);
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn try_bootstrap(
    config: &Arc<Config>,
    log: &Arc<Log>,
    client: &LogClient,
    token: &CancellationToken,
) -> Result<LogState, CycleError> {
    guard(token, config.state.prepare_log(&log.id))
        .await?
        .map_err(|e| CycleError::Transient {
            kind: "state",
            message: format!("preparing state for {}: {e}", log.url),
        })?;

    if let Some(state) = guard(token, config.state.load_log_state(&log.id))
        .await?
        .map_err(|e| CycleError::Transient {
            kind: "state",
            message: format!("loading state for {}: {e}", log.url),
        })?
    {
        return Ok(state);
    }

    let state = if config.start_at_end {
        // Accept the current head as ground truth; history before it
        // is never downloaded, trading historical matches for
        // bandwidth.
        let sth = guard(token, client.get_sth())
            .await?
            .map_err(|e| classify_client_error(log, e))?;
        sth.verify(&log.key)
            .map_err(|e| CycleError::Transient {
                kind: "protocol",
                message: format!("tree head from {}: {e}", log.url),
            })?;
        tracing::info!(
            "{}: starting at the current end, size {}",
            log.url,
            sth.tree_size,
        );
        LogState::sealed_at(&sth)
    } else {
        LogState::empty()
    };

    guard(token, config.state.store_log_state(&log.id, &state))
        .await?
        .map_err(|e| CycleError::Transient {
            kind: "state",
            message: format!("storing state for {}: {e}", log.url),
        })?;
    Ok(state)
}

impl Daemon {
    /// One polling cycle: fetch the newest head, then verify and
    /// drain every stored head in tree-size order.
    async fn cycle(&mut self, token: &CancellationToken) -> Result<(), CycleError> {
        self.poll(token).await?;

        let mut sths = guard(token, self.config.state.load_sths(&self.log.id))
            .await?
            .map_err(|e| self.transient("loading tree heads", &e.to_string()))?;
        sths.sort_by_key(|sth| (sth.tree_size, sth.timestamp));

        for sth in sths {
            match self.reconcile(token, &sth).await {
                Ok(()) => {}
                Err(error) => return Err(error),
            }
        }

        // The cycle reached a fully reconciled position; record the
        // time for health checking even when nothing new arrived.
        self.state.last_success = chrono::Utc::now();
        guard(token, self.config.state.store_log_state(&self.log.id, &self.state))
            .await?
            .map_err(|e| self.transient("storing state", &e.to_string()))?;
        Ok(())
    }

    /// Fetches and validates the current head, and checks it against
    /// the verified head for split views and regressions.
    async fn poll(&mut self, token: &CancellationToken) -> Result<(), CycleError> {
        let sth = guard(token, self.client.get_sth())
            .await?
            .map_err(|e| classify_client_error(&self.log, e))?;
        sth.verify(&self.log.key)
            .map_err(|e| self.transient("verifying tree head", &e.to_string()))?;

        if let Some(verified) = &self.state.verified_sth {
            if sth.tree_size < verified.tree_size {
                return Err(self
                    .fail(
                        token,
                        &format!(
                            "log presented tree size {} after signing size {}: \
                             the log is equivocating or has lost data",
                            sth.tree_size, verified.tree_size,
                        ),
                    )
                    .await);
            }
            if sth.tree_size == verified.tree_size
                && sth.sha256_root_hash != verified.sha256_root_hash
            {
                return Err(self
                    .fail(
                        token,
                        &format!(
                            "split view: two signed heads of size {} with roots {} and {}",
                            sth.tree_size, verified.sha256_root_hash, sth.sha256_root_hash,
                        ),
                    )
                    .await);
            }
            if sth.same_tree(verified) {
                return Ok(());
            }
        }

        guard(token, self.config.state.store_sth(&self.log.id, &sth))
            .await?
            .map_err(|e| self.transient("storing tree head", &e.to_string()))?;
        Ok(())
    }

    /// Brings the download position up to one stored head, commits,
    /// and prunes it.
    async fn reconcile(
        &mut self,
        token: &CancellationToken,
        target: &SignedTreeHead,
    ) -> Result<(), CycleError> {
        let verified_size = self
            .state
            .verified_sth
            .as_ref()
            .map(|sth| sth.tree_size)
            .unwrap_or(0);

        if self.state.verified_sth.is_some() {
            if target.tree_size < verified_size {
                // Verified past it in an earlier cycle; stale.
                return self.prune(token, target).await;
            }
            if target.tree_size == verified_size {
                let verified_root = self.state.verified_position.root();
                if target.sha256_root_hash != verified_root {
                    return Err(self
                        .fail(
                            token,
                            &format!(
                                "split view: stored head of size {} has root {}, verified \
                                 root is {verified_root}",
                                target.tree_size, target.sha256_root_hash,
                            ),
                        )
                        .await);
                }
                return self.prune(token, target).await;
            }
        }

        if self.state.download_position.size() > target.tree_size {
            // A previous cycle already downloaded past this head; it
            // can no longer be audited directly and will be pruned
            // once a larger head commits.
            return Ok(());
        }

        self.check_consistency(token, target).await?;
        let mut tree = match self.state.download_position.tree() {
            Some(tree) => tree.clone(),
            // Unsealed by check_consistency in every reachable path.
            None => return Err(self.transient("downloading", "position still sealed")),
        };

        self.download(token, target, &mut tree).await?;

        let root = tree.root();
        if root != target.sha256_root_hash {
            return Err(self
                .fail(
                    token,
                    &format!(
                        "downloaded entries for tree size {} imply root {root}, but the \
                         log signed {}",
                        target.tree_size, target.sha256_root_hash,
                    ),
                )
                .await);
        }

        // Commit: the verified position catches up to the download
        // position, and only committed state is persisted.
        let mut committed = self.state.clone();
        committed.download_position = Position::Tree(tree.clone());
        committed.verified_position = Position::Tree(tree);
        committed.verified_sth = Some(target.clone());
        committed.last_success = chrono::Utc::now();

        guard(token, self.config.state.store_log_state(&self.log.id, &committed))
            .await?
            .map_err(|e| self.transient("committing state", &e.to_string()))?;
        self.state = committed;

        tracing::info!(
            "{}: verified position advanced to {}",
            self.log.url,
            target.tree_size,
        );
        self.prune(token, target).await
    }

    /// Verifies the consistency proof from the verified head to
    /// `target`, rebuilding the spine if the position is sealed.
    async fn check_consistency(
        &mut self,
        token: &CancellationToken,
        target: &SignedTreeHead,
    ) -> Result<(), CycleError> {
        let Some(verified) = self.state.verified_sth.clone() else {
            // Nothing verified yet: the proof from size zero is empty
            // and the root check after download does all the work.
            return Ok(());
        };
        if verified.tree_size == 0 {
            return Ok(());
        }

        let proof = guard(
            token,
            self.client.get_consistency(verified.tree_size, target.tree_size),
        )
        .await?
        .map_err(|e| classify_client_error(&self.log, e))?;

        let verified_root = self.state.verified_position.root();
        let sealed = self.state.verified_position.tree().is_none();

        if sealed {
            // A start-at-end bootstrap knows only (size, root); the
            // verified proof also carries the subtree roots needed to
            // resume appending from that size.
            match CollapsedTree::from_consistency_proof(
                verified.tree_size,
                target.tree_size,
                &verified_root,
                &target.sha256_root_hash,
                &proof,
            ) {
                Ok(tree) => {
                    self.state.verified_position = Position::Tree(tree.clone());
                    self.state.download_position = Position::Tree(tree);
                }
                Err(e) => {
                    return Err(self
                        .fail(
                            token,
                            &format!(
                                "consistency proof from size {} to {} failed: {e}",
                                verified.tree_size, target.tree_size,
                            ),
                        )
                        .await);
                }
            }
        } else if let Err(e) = verify_consistency(
            verified.tree_size,
            target.tree_size,
            &verified_root,
            &target.sha256_root_hash,
            &proof,
        ) {
            return Err(self
                .fail(
                    token,
                    &format!(
                        "consistency proof from size {} to {} failed: {e}",
                        verified.tree_size, target.tree_size,
                    ),
                )
                .await);
        }
        Ok(())
    }

    /// Downloads entries `[tree.size(), target.tree_size)` in batches,
    /// matching each against the watch list and appending its leaf
    /// hash.
    async fn download(
        &mut self,
        token: &CancellationToken,
        target: &SignedTreeHead,
        tree: &mut CollapsedTree,
    ) -> Result<(), CycleError> {
        let mut empty_responses: u32 = 0;

        while tree.size() < target.tree_size {
            let start = tree.size();
            let end = (start + self.config.batch_size).min(target.tree_size) - 1;

            let entries = match guard(token, self.client.get_entries(start, end)).await? {
                Ok(entries) => entries,
                Err(error) if error.is_client_status() => {
                    // The head is signed but the entries are not yet
                    // served (replication lag). Not a failure.
                    tracing::debug!(
                        "{}: entries {start}..={end} not yet available: {error}",
                        self.log.url,
                    );
                    return Err(CycleError::Defer);
                }
                Err(error) => return Err(classify_client_error(&self.log, error)),
            };

            if entries.is_empty() {
                empty_responses += 1;
                if empty_responses >= EMPTY_RETRY_LIMIT {
                    // Give up on this cycle without rewinding; the
                    // download position keeps any partial progress.
                    return Err(self.transient(
                        "downloading entries",
                        &format!("{empty_responses} empty responses for {start}..={end}"),
                    ));
                }
                if !self.sleep(token, backoff_delay(empty_responses)).await {
                    return Err(CycleError::Cancelled);
                }
                continue;
            }
            empty_responses = 0;

            for raw in entries {
                let index = tree.size();
                let leaf_hash = certwatch_protocol::leaf::leaf_hash(&raw.leaf_input);

                match decode_entry(&raw.leaf_input, &raw.extra_data) {
                    Ok(decoded) => {
                        let matched = self
                            .config
                            .watch_list
                            .find_first_match(decoded.info.dns_identities.iter().map(String::as_str))
                            .map(|(_, pattern)| pattern.to_string());
                        if let Some(watch_item) = matched {
                            let cert = DiscoveredCert {
                                log: self.log.clone(),
                                log_id: self.log.id,
                                index,
                                leaf_hash,
                                is_precert: decoded.is_precert,
                                serial: decoded.info.serial,
                                not_before: decoded.info.not_before,
                                not_after: decoded.info.not_after,
                                issuer: decoded.info.issuer,
                                subject: decoded.info.subject,
                                dns_identities: decoded.info.dns_identities,
                                pubkey_sha256: decoded.info.pubkey_sha256,
                                watch_item,
                                entry_timestamp: decoded.timestamp,
                                chain: decoded.chain,
                            };
                            // Notification failure does not block the
                            // commit; it is surfaced instead.
                            if let Err(e) =
                                guard(token, self.config.state.notify_cert(&cert)).await?
                            {
                                self.surface(&format!(
                                    "failed to notify about {} (entry {index}): {e}",
                                    self.log.url,
                                ))
                                .await;
                            }
                        }
                    }
                    Err(error) => {
                        // The leaf hash is over the raw bytes, so a
                        // malformed entry still advances the position:
                        // skipping it is an observation, not a loss.
                        let entry = LogEntry {
                            log: self.log.clone(),
                            index,
                            leaf_hash,
                            leaf_input: raw.leaf_input.clone(),
                            extra_data: raw.extra_data.clone(),
                        };
                        if let Err(e) = guard(
                            token,
                            self.config
                                .state
                                .notify_malformed_entry(&entry, &error.to_string()),
                        )
                        .await?
                        {
                            self.surface(&format!(
                                "failed to report malformed entry {index} of {}: {e}",
                                self.log.url,
                            ))
                            .await;
                        }
                    }
                }

                tree.push(leaf_hash);
            }

            // Partial progress survives transient failures in memory,
            // but is never persisted until the commit.
            self.state.download_position = Position::Tree(tree.clone());
        }
        Ok(())
    }

    async fn prune(
        &mut self,
        token: &CancellationToken,
        sth: &SignedTreeHead,
    ) -> Result<(), CycleError> {
        guard(token, self.config.state.remove_sth(&self.log.id, sth))
            .await?
            .map_err(|e| self.transient("pruning tree head", &e.to_string()))?;
        Ok(())
    }

    /// Reports a fatal integrity violation and returns the marker
    /// that halts this log.
    async fn fail(&self, token: &CancellationToken, message: &str) -> CycleError {
        let message =
            format!("CONSISTENCY FAILURE for {}: {message}; halting this log", self.log.url);
        tracing::error!("{message}");
        match guard(token, self.config.state.notify_error(Some(&self.log), &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to report consistency failure: {e}"),
            Err(_) => return CycleError::Cancelled,
        }
        CycleError::Fatal
    }

    fn transient(&self, context: &'static str, error: &str) -> CycleError {
        CycleError::Transient {
            kind: context,
            message: format!("{}: {context}: {error}", self.log.url),
        }
    }

    /// Best-effort error surfacing that must not abort the cycle.
    async fn surface(&self, message: &str) {
        tracing::warn!("{message}");
        if let Err(e) = self.config.state.notify_error(Some(&self.log), message).await {
            tracing::warn!("failed to surface error for {}: {e}", self.log.url);
        }
    }

    fn note_failure(&mut self, kind: &'static str) {
        if self.failure_kind == Some(kind) {
            self.failures += 1;
        } else {
            self.failure_kind = Some(kind);
            self.failures = 1;
        }
    }

    /// The poll delay, jittered, stretched while the circuit breaker
    /// is open.
    fn poll_delay(&self) -> Duration {
        let mut delay = self.config.poll_interval;
        if self.failures >= CIRCUIT_THRESHOLD {
            delay *= CIRCUIT_FACTOR;
        }
        jittered(delay, 0.75, 1.25)
    }

    /// Sleeps unless cancelled; returns false on cancellation.
    async fn sleep(&self, token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Runs a future unless the token fires first.
async fn guard<T>(
    token: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, CycleError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CycleError::Cancelled),
        value = future => Ok(value),
    }
}

fn classify_client_error(log: &Log, error: ClientError) -> CycleError {
    let kind = if error.is_transient() {
        "network"
    } else {
        "protocol"
    };
    CycleError::Transient {
        kind,
        message: format!("{}: {error}", log.url),
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.min(BACKOFF_CAP_EXP);
    jittered(Duration::from_secs(1 << exp), 0.5, 1.5)
}

fn jittered(base: Duration, low: f64, high: f64) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(low..high))
}
