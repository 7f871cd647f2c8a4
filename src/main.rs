use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fabricator::config::Config;
use fabricator::gateway;
use fabricator::parts::MemoryPartClient;
use fabricator::scheduler::Engine;
use fabricator::store::{MemoryStore, PgStore, Store};

/// Manufacturing work orchestration daemon.
#[derive(Debug, Parser)]
#[command(name = "fabricatord")]
struct Args {
    /// Gateway bind address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// PostgreSQL connection string; in-memory store when omitted
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(url) = args.database_url {
        config.database_url = Some(url);
    }

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect to database")?;
            let store = PgStore::new(pool);
            store.init_schema().await?;
            info!("using postgres store");
            Arc::new(store)
        }
        None => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let parts = Arc::new(MemoryPartClient::new());
    let engine = Arc::new(Engine::new(store, parts));

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "fabricator gateway listening");
    gateway::serve(listener, engine, config.max_jobs_default).await
}
