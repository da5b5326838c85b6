use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use draftdeck::{config, db, sharing};

#[derive(Debug, Parser)]
#[command(author, version, about = "Delete expired and revoked share links")]
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/draftdeck.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let purged = sharing::purge_expired(&pool, chrono::Utc::now()).await?;
    info!(purged, "share cleanup finished");
    Ok(())
}
