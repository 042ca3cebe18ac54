//! Automation runner - main orchestration loop.
//!
//! Each cycle: load enabled rules, fetch signals (API or file), evaluate,
//! publish snapshots + active pairs + match audit records, write the status
//! file. A failing cycle logs, leaves the prior published state untouched
//! and retries on the next poll tick.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{RunnerConfig, SignalSource};
use crate::engine::evaluate_rules;
use crate::fetcher::SignalFetcher;
use crate::store::Store;
use crate::types::{FetchError, FetchMeta, Signal};

/// Operational state written wholesale after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub runner: &'static str,
    pub source: String,
    pub poll_seconds: u64,
    pub active_ttl_seconds: i64,
    pub cycle: u64,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub last_successful_cycle: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rules_loaded: usize,
    pub signals_loaded: usize,
    pub matches_count: usize,
    pub active_pairs_count: usize,
    pub fetch_meta: Option<FetchMeta>,
}

/// Counters from one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub rules_loaded: usize,
    pub signals_loaded: usize,
    pub matches_count: usize,
    pub active_pairs_count: usize,
    pub fetch_meta: FetchMeta,
}

pub struct Runner {
    store: Store,
    fetcher: SignalFetcher,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(store: Store, fetcher: SignalFetcher, config: RunnerConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Run until the shutdown channel flips. The inter-cycle wait is
    /// interrupted immediately on shutdown, so stop latency is bounded
    /// regardless of the configured poll interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            source = self.config.source.as_str(),
            poll_seconds = self.config.poll_interval.as_secs(),
            ttl_seconds = self.config.active_ttl_seconds,
            "starting automation runner"
        );

        let mut status = RunnerStatus {
            runner: "automation-runner",
            source: self.config.source.as_str().to_string(),
            poll_seconds: self.config.poll_interval.as_secs(),
            active_ttl_seconds: self.config.active_ttl_seconds,
            cycle: 0,
            last_fetch_time: None,
            last_successful_cycle: None,
            last_error: None,
            rules_loaded: 0,
            signals_loaded: 0,
            matches_count: 0,
            active_pairs_count: 0,
            fetch_meta: None,
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            status.cycle += 1;
            let cycle_started = Utc::now();
            status.last_fetch_time = Some(cycle_started);

            match self.run_cycle().await {
                Ok(summary) => {
                    status.last_successful_cycle = Some(Utc::now());
                    status.last_error = None;
                    status.rules_loaded = summary.rules_loaded;
                    status.signals_loaded = summary.signals_loaded;
                    status.matches_count = summary.matches_count;
                    status.active_pairs_count = summary.active_pairs_count;
                    status.fetch_meta = Some(summary.fetch_meta);

                    info!(
                        cycle = status.cycle,
                        rules = summary.rules_loaded,
                        signals = summary.signals_loaded,
                        matches = summary.matches_count,
                        active = summary.active_pairs_count,
                        elapsed_secs =
                            (Utc::now() - cycle_started).num_milliseconds() as f64 / 1000.0,
                        "cycle ok"
                    );
                }
                Err(e) => {
                    // Prior published state stays live: stale-but-valid
                    // beats wrong.
                    status.last_error = Some(e.to_string());
                    error!(cycle = status.cycle, error = %e, "cycle failed");
                }
            }

            if let Err(e) = write_status(&self.config.status_path, &status) {
                error!(error = %e, "failed to write status file");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("automation runner stopped");
        Ok(())
    }

    /// One fetch -> evaluate -> publish pass.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        let rules = self.store.list_all_rules(true).await?;
        let (signals, fetch_meta) = self.fetch_signals().await?;
        let (matches, active_pairs) = evaluate_rules(&signals, &rules);

        let snapshots: Vec<_> = signals
            .iter()
            .map(|s| (s.symbol.clone(), s.raw.clone()))
            .collect();

        self.store.upsert_signal_snapshots(&snapshots).await?;
        self.store
            .replace_active_pairs(&active_pairs, self.config.active_ttl_seconds)
            .await?;
        self.store
            .replace_rule_matches(&matches, self.config.active_ttl_seconds)
            .await?;

        Ok(CycleSummary {
            rules_loaded: rules.len(),
            signals_loaded: signals.len(),
            matches_count: matches.len(),
            active_pairs_count: active_pairs.len(),
            fetch_meta,
        })
    }

    async fn fetch_signals(&self) -> Result<(Vec<Signal>, FetchMeta), FetchError> {
        match self.config.source {
            SignalSource::Api => self.fetcher.fetch_all().await,
            SignalSource::File => {
                let path = self.config.file_path.as_deref().ok_or(FetchError::File {
                    path: "<unset>".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "file source configured without a file path",
                    ),
                })?;
                self.fetcher.load_from_file(path).await
            }
        }
    }
}

/// Write the status document atomically: temp file then rename, so external
/// monitors never observe a partial write.
fn write_status(path: &Path, status: &RunnerStatus) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(status)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
