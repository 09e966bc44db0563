use std::sync::Arc;

use clap::Parser;
use crawler_core::{CrawlerConfig, DataSourceType};
use crawler_engine::{CapabilitySet, Orchestrator};
use crawler_store::Database;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

mod website;

use website::WebsiteCrawler;

#[derive(Debug, Parser)]
#[command(name = "crawler-daemon", version, about = "Schedules and runs knowledge-base crawls")]
struct Args {
    /// Path to crawler.toml (default: ~/.crawler/crawler.toml)
    #[arg(long, env = "CRAWLER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crawler_daemon=info,crawler_engine=info,crawler_store=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = CrawlerConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CrawlerConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = Database::open(&db_path)?;

    let capabilities = CapabilitySet::new().with(
        DataSourceType::Website,
        Arc::new(WebsiteCrawler::new(&config.http)?),
    );
    info!(types = ?capabilities.registered(), "crawl capabilities registered");

    let orchestrator = Orchestrator::new(db, config, capabilities);
    let report = orchestrator.recover()?;
    if !report.requeued.is_empty() || !report.interrupted.is_empty() {
        info!(
            requeued = report.requeued.len(),
            interrupted = report.interrupted.len(),
            "resumed work from previous run"
        );
    }

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    event = event.name(),
                    job_id = %event.job_id(),
                    source_id = %event.source_id(),
                    "job event"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    orchestrator.start();
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    orchestrator.shutdown().await;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
