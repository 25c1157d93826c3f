use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crex_storage::{ListingStore, MemoryListingStore, PgListingStore};
use crex_sync::{build_scheduler, load_source_registry, QueryFacade, ScrapeRunner, SyncConfig};
use crex_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crex-cli")]
#[command(about = "Commercial real-estate listing aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape-and-reconcile pass, for one source or all enabled.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Serve the JSON API, with the cron scheduler if enabled.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// List the configured sources.
    Sources,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let registry = load_source_registry(&config.sources_path()).await?;

    match cli.command.unwrap_or(Commands::Sources) {
        Commands::Sync { source } => {
            let store = open_store(&config).await?;
            let runner = Arc::new(ScrapeRunner::new(config, registry, store)?);
            let sources: Vec<String> = match source {
                Some(id) => vec![id],
                None => runner
                    .registry()
                    .sources
                    .iter()
                    .filter(|s| s.enabled)
                    .map(|s| s.source_id.clone())
                    .collect(),
            };
            for source_id in sources {
                match runner.run_source(&source_id).await {
                    Ok(summary) => println!(
                        "{}: {} ({} listings, {} new, {} modified, {} removed, {} unchanged)",
                        summary.source,
                        summary.status,
                        summary.properties_count,
                        summary.new,
                        summary.modified,
                        summary.removed,
                        summary.unchanged,
                    ),
                    Err(err) => eprintln!("{source_id}: failed: {err}"),
                }
            }
        }
        Commands::Serve { port } => {
            let store = open_store(&config).await?;
            let data_dir = config.data_dir.clone();
            let runner = Arc::new(ScrapeRunner::new(config, registry, store.clone())?);
            if let Some(scheduler) = build_scheduler(runner.clone()).await? {
                scheduler.start().await?;
                info!("scheduler started");
            }
            let state = AppState::new(QueryFacade::new(store, data_dir), runner);
            info!(port, "serving API");
            crex_web::serve(state, port).await?;
        }
        Commands::Sources => {
            for source in &registry.sources {
                println!(
                    "{:<16} {:<24} enabled={} mode={} schedule=\"{}\"",
                    source.source_id,
                    source.display_name,
                    source.enabled,
                    source.mode,
                    source.schedule,
                );
            }
        }
        Commands::Migrate => {
            let Some(database_url) = config.database_url.as_deref() else {
                anyhow::bail!("DATABASE_URL is not set");
            };
            let store = PgListingStore::connect(database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ListingStore>> {
    match config.database_url.as_deref() {
        Some(database_url) => {
            let store = PgListingStore::connect(database_url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, listings will not survive restarts");
            Ok(Arc::new(MemoryListingStore::new()))
        }
    }
}
