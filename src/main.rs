//! repkv-server: one replica process.
//!
//! Configuration comes entirely from `REPKV_*` environment variables (see
//! [`replicated_kv::config`]). The process runs until SIGINT, then shuts
//! the RPC surface, the dispatcher, and the replica down in order.

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use replicated_kv::config::ServerConfig;
use replicated_kv::server::KvServer;

fn init_tracing(config: &ServerConfig) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_file {
        Some(path) => {
            let file = std::sync::Arc::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            );
            if config.log_json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
            }
        }
        None => {
            if config.log_json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ServerConfig::from_env()?;
    init_tracing(&config)?;

    let server = KvServer::start(&config).await?;

    if config.join_seed.is_none() {
        match server
            .replica()
            .wait_for_leader(Duration::from_secs(5))
            .await
        {
            Some(leader) => info!(leader, "cluster ready"),
            None => warn!("no leader elected within 5 s; still serving"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    server.shutdown().await;

    Ok(())
}
