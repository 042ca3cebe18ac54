//! Automation runner entry point.
//!
//! 1. Loads enabled automation rules from the store
//! 2. Fetches signals from the provider (or a static file)
//! 3. Evaluates rules against signals
//! 4. Publishes active pairs + match audit records with a fail-safe TTL
//! 5. Writes an operational status file after every cycle

use tokio::sync::watch;
use tracing::info;

use automation_runner::config::{FetchConfig, RunnerConfig};
use automation_runner::fetcher::SignalFetcher;
use automation_runner::runner::Runner;
use automation_runner::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenvy::dotenv().ok();

    let runner_config = RunnerConfig::from_env()?;
    let fetch_config = FetchConfig::from_env();

    info!(
        source = runner_config.source.as_str(),
        database_url = %runner_config.database_url,
        "starting automation runner"
    );

    let store = Store::connect(&runner_config.database_url).await?;
    let fetcher = SignalFetcher::new(fetch_config)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop signal received, shutting down");
            let _ = stop_tx.send(true);
        }
    });

    Runner::new(store, fetcher, runner_config).run(stop_rx).await
}
