#![forbid(unsafe_code)]

mod media;
mod metrics;
mod room;
mod signaling;

use anyhow::Result;
use media::{MediaConfig, WorkerPool};
use metrics::ServerMetrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,mediasoup=warn,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomcast - starting SFU signaling core");

    let config = MediaConfig::from_env();

    // the pool must be fully live before the gateway accepts traffic;
    // a partial pool is a startup failure
    let pool = Arc::new(WorkerPool::start(&config.worker).await?);
    info!("worker pool ready with {} workers", pool.size());

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(pool, config, metrics.clone()));

    let server = SignalingServer::new(registry.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            registry.shutdown().await;
        }
    }

    info!("shutdown complete");
    Ok(())
}
