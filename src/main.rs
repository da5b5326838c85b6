use anyhow::Result;
use clap::Parser;
use draftdeck::{config, db, dispatch, sharing};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Publication daemon for scheduled drafts")]
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
        .unwrap_or_else(|_| format!("sqlite://{}/draftdeck.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    // Hourly cleanup of expired and revoked share links.
    let cleanup_pool = pool.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(err) = sharing::purge_expired(&cleanup_pool, chrono::Utc::now()).await {
                error!(?err, "share cleanup failed");
            }
        }
    });

    // Dispatch loop: publish due drafts, sleep when idle.
    let dispatcher = dispatch::NoopDispatcher;
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    info!("starting publication daemon");
    loop {
        match dispatch::process_due_draft(&pool, &dispatcher, &cfg, chrono::Utc::now()).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "dispatch worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
