use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use iprep_sources::{SourceContext, SourceRegistry};
use iprep_storage::PgEntryStore;
use iprep_sync::config::load_manager_file;
use iprep_sync::{maybe_build_scheduler, CleaningPipeline, IprepConfig, SourceManager};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "iprep")]
#[command(about = "IP reputation ingest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh every enabled source once.
    Sync {
        #[arg(long)]
        max_workers: Option<usize>,
        /// Clean but do not persist.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print per-source health as JSON.
    Status,
    /// List plugin kinds and configured sources.
    Sources,
    /// Run a JSON array of loose records through the cleaning pipeline.
    Clean {
        #[arg(long)]
        source: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Refresh on `IPREP_SYNC_CRON` until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("iprep=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = IprepConfig::from_env();

    match cli
        .command
        .unwrap_or(Commands::Sync { max_workers: None, dry_run: false })
    {
        Commands::Sync { max_workers, dry_run } => {
            let manager = build_manager(&config, !dry_run).await?;
            let summary = manager
                .update_all_sources(max_workers.unwrap_or(config.max_workers))
                .await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status => {
            let manager = build_manager(&config, false).await?;
            println!("{}", serde_json::to_string_pretty(&manager.get_source_status())?);
        }
        Commands::Sources => {
            let manager = build_manager(&config, false).await?;
            println!("plugins: {}", manager.registry().list_registered().join(", "));
            for name in manager.list_sources() {
                println!("source: {name}");
            }
        }
        Commands::Clean { source, input, output } => {
            clean_file(&config, &source, &input, output.as_deref()).await?;
        }
        Commands::Schedule => {
            let manager = Arc::new(build_manager(&config, true).await?);
            let mut config = config;
            config.scheduler_enabled = true;
            let Some(mut sched) = maybe_build_scheduler(&config, manager).await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn build_manager(config: &IprepConfig, persist: bool) -> Result<SourceManager> {
    let ctx = SourceContext::new(config.http_client_config(), &config.artifacts_dir)?;
    let registry = SourceRegistry::new(ctx);
    registry.auto_discover_sources();

    let mut manager = SourceManager::new(Arc::new(registry), &config.config_path);
    match (&config.database_url, persist) {
        (Some(url), true) => {
            let store = PgEntryStore::connect(url).await?;
            manager = manager.with_store(Arc::new(store));
        }
        (None, true) => warn!("DATABASE_URL not set; cleaned entries will not be persisted"),
        _ => {}
    }
    manager
        .load_config()
        .await
        .with_context(|| format!("loading {}", config.config_path.display()))?;
    Ok(manager)
}

async fn clean_file(
    config: &IprepConfig,
    source: &str,
    input: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let scoring = load_manager_file(&config.config_path).await?.cleaning;
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let records: Vec<JsonValue> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {} as a JSON array", input.display()))?;

    let result = CleaningPipeline::new(source, scoring).process_batch(&records).await;
    info!(
        source,
        total_processed = result.stats.total_processed,
        valid_ips = result.stats.valid_ips,
        invalid_ips = result.stats.invalid_ips,
        duplicates = result.stats.duplicates,
        "clean preview finished"
    );

    let rendered = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => tokio::fs::write(path, rendered)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}
