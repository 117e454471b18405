#![forbid(unsafe_code)]

use anyhow::Result;
use ephemchat::attachments::AttachmentStore;
use ephemchat::metrics::ServerMetrics;
use ephemchat::room::RoomManager;
use ephemchat::sfu::fake::FakeSfu;
use ephemchat::sfu::SfuAdapter;
use ephemchat::signaling::SignalingServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ephemchat=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("ephemchat - starting server");

    // Attachment store (upload dir must exist before the first upload)
    let upload_dir: PathBuf = std::env::var("UPLOAD_DIR")
        .unwrap_or_else(|_| "uploads".to_string())
        .into();
    let store = AttachmentStore::new(upload_dir.clone());
    store.ensure_dir().await?;
    info!("Attachment store at {}", upload_dir.display());

    // Media engine adapter. Without an external engine wired up the server
    // runs against the in-memory adapter: full room/voice coordination,
    // no media forwarding.
    let sfu = Arc::new(FakeSfu::new());
    info!("No external media engine configured; using the in-memory SFU adapter");

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(sfu.clone(), store, metrics.clone()));
    room_manager.spawn_sfu_event_pump();

    info!("Room manager initialized");

    let server = SignalingServer::new(room_manager, upload_dir, metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sfu.terminated() => {
            // Room and voice state cannot be reattached to a fresh engine;
            // refuse to limp along.
            error!("Media engine terminated unexpectedly, exiting");
            std::process::exit(1);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
