use anyhow::{Context, Result};
use clap::Parser;
use hareplica_server::replication::Primary;
use hareplica_server::server::AppState;
use hareplica_server::{QueueManager, ServerConfig, create_router};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hareplica-server")]
#[command(about = "Queue broker with primary-side HA replication", long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting hareplica server v{}", env!("CARGO_PKG_VERSION"));

    let queue_manager = Arc::new(QueueManager::new());
    for name in &config.queues {
        queue_manager.create_queue(name).await?;
    }

    let primary = if config.ha.enabled {
        let primary = Primary::promote(
            config.ha.broker_info(),
            config.ha.clone(),
            &queue_manager.queues(),
        );
        start_backup_expiry(Arc::clone(&primary));
        Some(primary)
    } else {
        info!("HA disabled, running standalone");
        None
    };

    let app = create_router(AppState {
        queue_manager,
        primary,
    });

    let addr = config.server_addr();
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically give up on expected backups until the primary is active
fn start_backup_expiry(primary: Arc<Primary>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        while !primary.is_active() {
            interval.tick().await;
            let expired = primary.expire_expected_backups();
            if !expired.is_empty() {
                warn!("Gave up on {} expected backups", expired.len());
            }
        }
        info!("Primary {} active", primary.info());
    })
}
