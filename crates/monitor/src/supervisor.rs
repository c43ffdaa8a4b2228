//! The supervisor: owns the per-log monitor tasks, reconciles them
//! against the refreshing log list, and schedules health checks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use certwatch_client::{build_http_client, fetch_log_list, LogClient};
use certwatch_protocol::loglist::{Log, LogStatus};
use certwatch_protocol::LogId;

use crate::daemon;
use crate::healthcheck::{self, HealthCheckFailure};
use crate::Config;

/// A running per-log monitor. Dropping the handle after cancelling
/// the token retires the log; its state stays on disk.
struct MonitorHandle {
    log: Arc<Log>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Supervisor {
    config: Arc<Config>,
    http: reqwest::Client,
    monitors: IndexMap<LogId, MonitorHandle>,
    list_last_success: DateTime<Utc>,
    list_last_error: Option<(String, DateTime<Utc>)>,
}

/// Runs the monitor: loads the log list, spawns one task per usable
/// log, and supervises them until `token` fires.
///
/// Only the initial log list load can fail the run; after that,
/// failures are surfaced through the state provider and retried.
pub async fn run(config: Config, token: CancellationToken) -> anyhow::Result<()> {
    let config = Arc::new(config);
    config.state.prepare().await?;

    let http = build_http_client()?;
    let list = fetch_log_list(&http, &config.log_list_source)
        .await
        .map_err(|e| anyhow::anyhow!("loading log list from {}: {e}", config.log_list_source))?;

    let mut supervisor = Supervisor {
        config: config.clone(),
        http,
        monitors: IndexMap::new(),
        list_last_success: Utc::now(),
        list_last_error: None,
    };
    supervisor.reconcile(&list, &token).await;

    let mut reload = tokio::time::interval(config.log_list_refresh_interval);
    let mut health = tokio::time::interval(config.health_check_interval);
    // Both intervals fire immediately; the work just happened.
    reload.tick().await;
    health.tick().await;
    reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = reload.tick() => supervisor.refresh(&token).await,
            _ = health.tick() => supervisor.health_sweep().await,
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

impl Supervisor {
    /// Reloads the log list and reconciles the monitor set.
    async fn refresh(&mut self, token: &CancellationToken) {
        match fetch_log_list(&self.http, &self.config.log_list_source).await {
            Ok(list) => {
                self.list_last_success = Utc::now();
                self.list_last_error = None;
                self.reconcile(&list, token).await;
            }
            Err(error) => {
                tracing::warn!(
                    "failed to refresh log list from {}: {error}",
                    self.config.log_list_source,
                );
                self.list_last_error = Some((error.to_string(), Utc::now()));
            }
        }
    }

    /// Starts monitors for new usable logs and retires monitors whose
    /// logs left the list.
    async fn reconcile(&mut self, list: &certwatch_protocol::loglist::LogList, token: &CancellationToken) {
        let mut current: IndexMap<LogId, Arc<Log>> = IndexMap::new();
        for resolved in list.logs() {
            match resolved {
                Ok(log) if log.status == LogStatus::Usable => {
                    current.insert(log.id, Arc::new(log));
                }
                Ok(log) => {
                    tracing::debug!("skipping {} log {}", status_name(log.status), log.url);
                }
                Err(error) => {
                    if let Err(e) = self
                        .config
                        .state
                        .notify_error(None, &format!("unusable log list entry: {error}"))
                        .await
                    {
                        tracing::warn!("failed to report log list entry error: {e}");
                    }
                }
            }
        }

        // Retire monitors first so a re-keyed log never has two
        // writers.
        let gone: Vec<LogId> = self
            .monitors
            .keys()
            .filter(|id| !current.contains_key(*id))
            .copied()
            .collect();
        for id in gone {
            if let Some(monitor) = self.monitors.shift_remove(&id) {
                tracing::info!("retiring monitor for {}", monitor.log.url);
                monitor.token.cancel();
                if let Err(e) = monitor.handle.await {
                    tracing::warn!("monitor task for {} panicked: {e}", monitor.log.url);
                }
            }
        }

        for (id, log) in current {
            if self.monitors.contains_key(&id) {
                continue;
            }
            tracing::info!("starting monitor for {}", log.url);
            let child = token.child_token();
            let client = LogClient::new(self.http.clone(), log.url.clone());
            let handle = tokio::spawn(daemon::run_log(
                self.config.clone(),
                log.clone(),
                client,
                child.clone(),
            ));
            self.monitors.insert(
                id,
                MonitorHandle {
                    log,
                    token: child,
                    handle,
                },
            );
        }
    }

    /// One health check pass over every monitored log, plus the log
    /// list itself.
    async fn health_sweep(&self) {
        let interval = chrono::Duration::from_std(self.config.health_check_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        for monitor in self.monitors.values() {
            if let Err(error) =
                healthcheck::check_log(self.config.state.as_ref(), &monitor.log, interval).await
            {
                tracing::warn!("health check for {} failed: {error}", monitor.log.url);
            }
        }

        if Utc::now() - self.list_last_success >= interval {
            let (last_error, last_error_time) = self
                .list_last_error
                .clone()
                .unwrap_or_else(|| ("unknown".to_string(), Utc::now()));
            let failure = HealthCheckFailure::StaleLogList {
                source: self.config.log_list_source.clone(),
                last_success: self.list_last_success,
                last_error,
                last_error_time,
            };
            if let Err(e) = self
                .config
                .state
                .notify_health_check_failure(None, &failure)
                .await
            {
                tracing::warn!("failed to report stale log list: {e}");
            }
        }
    }

    /// Cancels every monitor and waits for them to finish.
    async fn shutdown(self) {
        for monitor in self.monitors.values() {
            monitor.token.cancel();
        }
        for (_, monitor) in self.monitors {
            if let Err(e) = monitor.handle.await {
                tracing::warn!("monitor task for {} panicked: {e}", monitor.log.url);
            }
        }
    }
}

fn status_name(status: LogStatus) -> &'static str {
    match status {
        LogStatus::Pending => "pending",
        LogStatus::Qualified => "qualified",
        LogStatus::Usable => "usable",
        LogStatus::ReadOnly => "read-only",
        LogStatus::Retired => "retired",
        LogStatus::Rejected => "rejected",
    }
}
