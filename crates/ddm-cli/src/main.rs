use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ddm_core::DemandHints;
use ddm_engine::DedupEngine;
use ddm_storage::{
    Authorizer, CanonicalDemandStore, ConfigStore, MemoryStore, PgStore, RawPostingStore,
    StaticAdminList,
};
use ddm_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ddm")]
#[command(about = "Demand deduplication & matching engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        #[arg(long, default_value_t = 8000, env = "DDM_PORT")]
        port: u16,
    },
    /// Create the database schema.
    Migrate,
    /// Ingest one posting from the command line.
    Ingest {
        raw_text: String,
        /// Structured hints as a JSON object.
        #[arg(long)]
        hints: Option<String>,
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Probe recent demands for similarity without writing anything.
    CheckSimilar {
        raw_text: String,
        #[arg(long)]
        hints: Option<String>,
        #[arg(long)]
        since_days: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

struct Stores {
    raws: Arc<dyn RawPostingStore>,
    canonicals: Arc<dyn CanonicalDemandStore>,
    configs: Arc<dyn ConfigStore>,
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
async fn stores_from_env() -> Result<Stores> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = Arc::new(
                PgStore::connect(&url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            );
            info!("using postgres storage");
            Ok(Stores {
                raws: store.clone(),
                canonicals: store.clone(),
                configs: store,
            })
        }
        Err(_) => {
            info!("DATABASE_URL not set; using in-memory storage");
            let store = MemoryStore::new();
            Ok(Stores {
                raws: store.clone(),
                canonicals: store.clone(),
                configs: store,
            })
        }
    }
}

fn authorizer_from_env() -> Arc<dyn Authorizer> {
    let uids = std::env::var("DDM_ADMIN_UIDS").unwrap_or_default();
    Arc::new(StaticAdminList::from_env_value(&uids))
}

async fn engine_from_env() -> Result<DedupEngine> {
    let stores = stores_from_env().await?;
    Ok(DedupEngine::new(
        stores.raws,
        stores.canonicals,
        stores.configs,
        authorizer_from_env(),
    ))
}

fn parse_hints(raw: Option<&str>) -> Result<DemandHints> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("parsing --hints JSON"),
        None => Ok(DemandHints::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let engine = engine_from_env().await?;
            ddm_web::serve(AppState::new(Arc::new(engine)), port).await?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
            let store = PgStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            println!("schema up to date");
        }
        Commands::Ingest {
            raw_text,
            hints,
            source,
        } => {
            let engine = engine_from_env().await?;
            let hints = parse_hints(hints.as_deref())?;
            let receipt = engine
                .ingest(&raw_text, hints, None, &source)
                .await
                .context("ingesting posting")?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::CheckSimilar {
            raw_text,
            hints,
            since_days,
            limit,
        } => {
            let engine = engine_from_env().await?;
            let hints = parse_hints(hints.as_deref())?;
            let report = engine
                .check_similar(&raw_text, &hints, since_days, limit, None, None)
                .await
                .context("checking similarity")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
