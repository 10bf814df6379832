use anyhow::Result;
use clap::Parser;
use grovesync::engine::{SyncConfig, SyncEngine};
use grovesync::remote::HttpAcceptor;
use grovesync::{config, connectivity, store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/grovesync.db", cfg.app.data_dir));

    let pool = store::init_pool(&database_url).await?;
    store::run_migrations(&pool).await?;
    let recovered = store::recover_interrupted(&pool).await?;
    if recovered > 0 {
        info!(recovered, "requeued submissions interrupted by last shutdown");
    }

    let acceptor = Arc::new(HttpAcceptor::new(
        &cfg.remote.base_url,
        cfg.remote.token.clone(),
        Duration::from_secs(30),
    )?);

    let monitor = connectivity::ConnectivityMonitor::new(false);
    let _probe = connectivity::spawn_probe(
        monitor.clone(),
        cfg.remote.base_url.clone(),
        Duration::from_secs(cfg.remote.probe_interval_secs),
    );

    let engine = SyncEngine::new(
        pool,
        acceptor,
        SyncConfig {
            max_in_flight: cfg.sync.max_in_flight,
            backoff_base_secs: cfg.sync.backoff_base_seconds as i64,
            max_backoff_secs: cfg.sync.max_backoff_seconds as i64,
            drain_interval: Duration::from_secs(cfg.sync.drain_interval_secs),
        },
        monitor.subscribe(),
    );

    info!("starting grovesync daemon");
    engine.run().await;
    Ok(())
}
