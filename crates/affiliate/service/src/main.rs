use affiliate_service::scheduler::ClearingScheduler;
use affiliate_service::{build_router, ServiceConfig, ServiceState, StorageConfig};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "affiliated", version, about = "Affiliate attribution and commission service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092")]
    listen: SocketAddr,
    /// JSON config file with `storage` and `ledger` sections.
    #[arg(long, env = "AFFILIATE_CONFIG")]
    config: Option<PathBuf>,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "AFFILIATE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for affiliate, referral and payout records.
    #[arg(long, env = "AFFILIATE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "AFFILIATE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Override the clearing sweep interval, in seconds.
    #[arg(long, env = "AFFILIATE_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,
    /// Do not run the clearing sweep in the background.
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

fn resolve_storage(cli: &Cli, configured: StorageConfig) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => configured,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "affiliate_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match cli.config.as_deref() {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    config.storage = resolve_storage(&cli, config.storage)?;
    if let Some(secs) = cli.sweep_interval_secs {
        config.ledger.sweep.interval_secs = secs;
    }
    let interval = config.ledger.sweep.interval();

    let state = ServiceState::bootstrap(config).await?;
    let scheduler = if cli.no_scheduler {
        None
    } else {
        let (scheduler, trigger_rx) = ClearingScheduler::new(Arc::clone(&state.ledger), interval);
        tokio::spawn(Arc::clone(&scheduler).start(trigger_rx));
        Some(scheduler)
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("affiliate-service REST listening on {}", listener.local_addr()?);

    let shutdown_scheduler = scheduler.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            if let Some(scheduler) = shutdown_scheduler {
                scheduler.stop();
            }
        })
        .await?;

    Ok(())
}
