//! The filesystem-backed state provider: per-log state documents,
//! observed tree heads, discovered certificates, and notification
//! fan-out, all under one state directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::json;

use certwatch_monitor::healthcheck::HealthCheckFailure;
use certwatch_monitor::{DiscoveredCert, LogEntry, LogState, StateProvider};
use certwatch_protocol::loglist::Log;
use certwatch_protocol::{LogId, SignedTreeHead};

use crate::notify::{Notification, Notifier};

const LOGS_DIRECTORY: &str = "logs";
const CERTS_DIRECTORY: &str = "certs";
const HEALTHCHECKS_DIRECTORY: &str = "healthchecks";
const UNVERIFIED_STHS_DIRECTORY: &str = "unverified_sths";
const MALFORMED_DIRECTORY: &str = "malformed";
const STATE_FILE: &str = "state.json";

/// `StateProvider` over a state directory:
///
/// ```text
/// <state_dir>/logs/<log-id>/state.json
/// <state_dir>/logs/<log-id>/unverified_sths/<size>-<time>-<root>.json
/// <state_dir>/logs/<log-id>/malformed/<index>.json
/// <state_dir>/logs/<log-id>/healthchecks/<time>.txt
/// <state_dir>/certs/<prefix>/<leaf-hash>.pem (+ .json)
/// <state_dir>/healthchecks/<time>.txt
/// ```
///
/// Documents are written to a temporary file and renamed into place,
/// so a crash never leaves a partial document visible.
pub struct FilesystemState {
    state_dir: PathBuf,
    save_certs: bool,
    notifier: Notifier,
}

impl FilesystemState {
    pub fn new(state_dir: impl Into<PathBuf>, save_certs: bool, notifier: Notifier) -> Self {
        Self {
            state_dir: state_dir.into(),
            save_certs,
            notifier,
        }
    }

    fn log_dir(&self, log_id: &LogId) -> PathBuf {
        self.state_dir
            .join(LOGS_DIRECTORY)
            .join(log_id.to_path_component())
    }

    fn sth_path(&self, log_id: &LogId, sth: &SignedTreeHead) -> PathBuf {
        // Keyed by (timestamp, root): observing the same head twice
        // stores it once.
        let root = URL_SAFE_NO_PAD.encode(sth.sha256_root_hash.as_bytes());
        self.log_dir(log_id).join(UNVERIFIED_STHS_DIRECTORY).join(format!(
            "{}-{}-{root}.json",
            sth.tree_size, sth.timestamp,
        ))
    }

    fn cert_paths(&self, cert: &DiscoveredCert) -> (PathBuf, PathBuf) {
        let name = URL_SAFE_NO_PAD.encode(cert.leaf_hash.as_bytes());
        let dir = self.state_dir.join(CERTS_DIRECTORY).join(&name[..2]);
        (dir.join(format!("{name}.pem")), dir.join(format!("{name}.json")))
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notifier.notify(&notification).await
    }

    /// Writes a health check report file and returns its path.
    fn write_healthcheck_file(&self, log: Option<&Log>, text: &str) -> Result<PathBuf> {
        let dir = match log {
            Some(log) => self.log_dir(&log.id).join(HEALTHCHECKS_DIRECTORY),
            None => self.state_dir.join(HEALTHCHECKS_DIRECTORY),
        };
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{}.txt",
            chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ"),
        ));
        write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }
}

#[async_trait]
impl StateProvider for FilesystemState {
    async fn prepare(&self) -> Result<()> {
        for dir in [
            self.state_dir.clone(),
            self.state_dir.join(LOGS_DIRECTORY),
            self.state_dir.join(CERTS_DIRECTORY),
            self.state_dir.join(HEALTHCHECKS_DIRECTORY),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    async fn prepare_log(&self, log_id: &LogId) -> Result<()> {
        let dir = self.log_dir(log_id);
        for dir in [
            dir.clone(),
            dir.join(UNVERIFIED_STHS_DIRECTORY),
            dir.join(MALFORMED_DIRECTORY),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    async fn store_log_state(&self, log_id: &LogId, state: &LogState) -> Result<()> {
        let path = self.log_dir(log_id).join(STATE_FILE);
        let document = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &document)
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn load_log_state(&self, log_id: &LogId) -> Result<Option<LogState>> {
        let path = self.log_dir(log_id).join(STATE_FILE);
        let document = match std::fs::read(&path) {
            Ok(document) => document,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Some(serde_json::from_slice(&document).with_context(
            || format!("parsing {}", path.display()),
        )?))
    }

    async fn store_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()> {
        let path = self.sth_path(log_id, sth);
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, &serde_json::to_vec_pretty(sth)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn load_sths(&self, log_id: &LogId) -> Result<Vec<SignedTreeHead>> {
        let dir = self.log_dir(log_id).join(UNVERIFIED_STHS_DIRECTORY);
        let mut sths = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sths),
            Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let document = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_slice::<SignedTreeHead>(&document) {
                Ok(sth) => sths.push(sth),
                Err(e) => {
                    tracing::warn!("skipping unparseable tree head {}: {e}", path.display());
                }
            }
        }
        sths.sort_by_key(|sth| (sth.tree_size, sth.timestamp));
        Ok(sths)
    }

    async fn remove_sth(&self, log_id: &LogId, sth: &SignedTreeHead) -> Result<()> {
        let path = self.sth_path(log_id, sth);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    async fn notify_cert(&self, cert: &DiscoveredCert) -> Result<()> {
        let (pem_path, json_path) = self.cert_paths(cert);
        let mut environ = cert_environ(cert);

        if self.save_certs {
            if let Some(parent) = pem_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_atomic(&pem_path, chain_to_pem(&cert.chain).as_bytes())
                .with_context(|| format!("writing {}", pem_path.display()))?;
            write_atomic(&json_path, &serde_json::to_vec_pretty(cert)?)
                .with_context(|| format!("writing {}", json_path.display()))?;
            environ.push(("CERT_FILENAME".into(), pem_path.display().to_string()));
            environ.push(("JSON_FILENAME".into(), json_path.display().to_string()));
        }

        self.notify(Notification {
            event: "discovered_cert",
            summary: cert_summary(cert),
            text: cert_text(cert, self.save_certs.then_some(pem_path.as_path())),
            environ,
            json: serde_json::to_value(cert)?,
        })
        .await
    }

    async fn notify_malformed_entry(&self, entry: &LogEntry, error: &str) -> Result<()> {
        let path = self
            .log_dir(&entry.log.id)
            .join(MALFORMED_DIRECTORY)
            .join(format!("{}.json", entry.index));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = json!({
            "log_url": entry.log.url.as_str(),
            "index": entry.index,
            "leaf_hash": entry.leaf_hash,
            "leaf_input": STANDARD.encode(&entry.leaf_input),
            "extra_data": STANDARD.encode(&entry.extra_data),
            "error": error,
        });
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)
            .with_context(|| format!("writing {}", path.display()))?;

        self.notify(Notification {
            event: "malformed_cert",
            summary: format!(
                "Unable to parse entry {} in {}",
                entry.index, entry.log.url,
            ),
            text: format!(
                "certwatch was unable to parse entry {} in {}:\n\n{error}\n\n\
                 The raw entry was saved to {}\n",
                entry.index,
                entry.log.url,
                path.display(),
            ),
            environ: vec![
                ("LOG_URI".into(), entry.log.url.to_string()),
                ("ENTRY_INDEX".into(), entry.index.to_string()),
                ("LEAF_HASH".into(), entry.leaf_hash.to_base64()),
                ("PARSE_ERROR".into(), error.to_string()),
                ("ENTRY_FILENAME".into(), path.display().to_string()),
            ],
            json: record,
        })
        .await
    }

    async fn notify_health_check_failure(
        &self,
        log: Option<&Log>,
        failure: &HealthCheckFailure,
    ) -> Result<()> {
        let text = failure.text();
        let path = self.write_healthcheck_file(log, &text)?;

        let mut environ = vec![("TEXT_FILENAME".into(), path.display().to_string())];
        if let Some(log) = log {
            environ.push(("LOG_URI".into(), log.url.to_string()));
        }

        self.notify(Notification {
            event: "healthcheck_failure",
            summary: failure.summary(),
            text,
            environ,
            json: failure.json(),
        })
        .await
    }

    async fn notify_error(&self, log: Option<&Log>, error: &str) -> Result<()> {
        // Errors are transient and retried; they go to the operator's
        // logs, not to the notification sinks.
        match log {
            Some(log) => tracing::warn!("{}: {error}", log.url),
            None => tracing::warn!("{error}"),
        }
        Ok(())
    }
}

fn cert_summary(cert: &DiscoveredCert) -> String {
    let identity = cert
        .dns_identities
        .first()
        .map(String::as_str)
        .unwrap_or("certificate");
    format!("{identity} (matched {})", cert.watch_item)
}

fn cert_text(cert: &DiscoveredCert, pem_path: Option<&Path>) -> String {
    let mut text = format!(
        "A {} matching your watch item \"{}\" was discovered:\n\n",
        if cert.is_precert {
            "pre-certificate"
        } else {
            "certificate"
        },
        cert.watch_item,
    );
    text.push_str(&format!("      DNS Names = {}\n", cert.dns_identities.join(", ")));
    text.push_str(&format!("         Issuer = {}\n", cert.issuer));
    text.push_str(&format!("        Subject = {}\n", cert.subject));
    text.push_str(&format!("         Serial = {}\n", cert.serial));
    if let Some(not_before) = cert.not_before {
        text.push_str(&format!("     Not Before = {not_before}\n"));
    }
    if let Some(not_after) = cert.not_after {
        text.push_str(&format!("      Not After = {not_after}\n"));
    }
    text.push_str(&format!("  Pubkey SHA256 = {}\n", cert.pubkey_sha256));
    text.push_str(&format!("        Log URI = {}\n", cert.log.url));
    text.push_str(&format!("    Entry Index = {}\n", cert.index));
    text.push_str(&format!("      Leaf Hash = {}\n", cert.leaf_hash));
    if let Some(path) = pem_path {
        text.push_str(&format!("       Filename = {}\n", path.display()));
    }
    text
}

fn cert_environ(cert: &DiscoveredCert) -> Vec<(String, String)> {
    vec![
        ("WATCH_ITEM".into(), cert.watch_item.clone()),
        ("LOG_URI".into(), cert.log.url.to_string()),
        ("ENTRY_INDEX".into(), cert.index.to_string()),
        ("LEAF_HASH".into(), cert.leaf_hash.to_base64()),
        ("SERIAL".into(), cert.serial.clone()),
        ("DNS_NAMES".into(), cert.dns_identities.join(",")),
        ("PUBKEY_SHA256".into(), cert.pubkey_sha256.clone()),
        (
            "NOT_BEFORE".into(),
            cert.not_before.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ),
        (
            "NOT_AFTER".into(),
            cert.not_after.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ),
    ]
}

fn chain_to_pem(chain: &[Vec<u8>]) -> String {
    let mut pem = String::new();
    for der in chain {
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        let encoded = STANDARD.encode(der);
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
    }
    pem
}

/// Writes via a temporary file in the same directory, then renames
/// into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use certwatch_monitor::LogState;
    use certwatch_protocol::SignedTreeHead;

    use super::*;

    fn provider() -> (tempfile::TempDir, FilesystemState) {
        let dir = tempfile::tempdir().unwrap();
        let state = FilesystemState::new(dir.path(), true, Notifier::default());
        (dir, state)
    }

    fn sth(tree_size: u64, timestamp: u64) -> SignedTreeHead {
        SignedTreeHead {
            tree_size,
            timestamp,
            sha256_root_hash: certwatch_merkle::hash_empty(),
            tree_head_signature: vec![4, 3, 0, 0],
        }
    }

    #[tokio::test]
    async fn test_log_state_round_trips() {
        let (_dir, provider) = provider();
        let log_id = LogId::from_spki(b"key");
        provider.prepare().await.unwrap();
        provider.prepare_log(&log_id).await.unwrap();

        assert!(provider.load_log_state(&log_id).await.unwrap().is_none());

        let state = LogState::empty();
        provider.store_log_state(&log_id, &state).await.unwrap();
        let loaded = provider.load_log_state(&log_id).await.unwrap().unwrap();
        assert_eq!(loaded.download_position, state.download_position);
        assert_eq!(loaded.verified_sth, state.verified_sth);
    }

    #[tokio::test]
    async fn test_sths_sort_and_dedupe() {
        let (_dir, provider) = provider();
        let log_id = LogId::from_spki(b"key");
        provider.prepare().await.unwrap();
        provider.prepare_log(&log_id).await.unwrap();

        provider.store_sth(&log_id, &sth(20, 2000)).await.unwrap();
        provider.store_sth(&log_id, &sth(10, 1000)).await.unwrap();
        // Same (timestamp, root): ignored.
        provider.store_sth(&log_id, &sth(10, 1000)).await.unwrap();

        let sths = provider.load_sths(&log_id).await.unwrap();
        assert_eq!(
            sths.iter().map(|s| s.tree_size).collect::<Vec<_>>(),
            vec![10, 20]
        );

        provider.remove_sth(&log_id, &sths[0]).await.unwrap();
        // Removing twice is fine.
        provider.remove_sth(&log_id, &sths[0]).await.unwrap();
        assert_eq!(provider.load_sths(&log_id).await.unwrap().len(), 1);
    }

    #[test]
    fn test_pem_wraps_at_64_columns() {
        let pem = chain_to_pem(&[vec![0xab; 100]]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
        for line in pem.lines() {
            assert!(line.len() <= 64);
        }
    }
}
