#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and HTTP surface

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket message. Sized for a cap-size upload arriving
/// base64-encoded inside its JSON envelope.
const MAX_WS_MESSAGE_BYTES: usize = 80 * 1024 * 1024;

/// Strict origin policy for every response: no inline scripts, self-only
/// media and connect sources (plus WebSocket).
const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; \
    style-src 'self'; img-src 'self' data: blob:; media-src 'self' blob:; \
    connect-src 'self' ws: wss:; object-src 'none'; base-uri 'self'";

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    upload_dir: PathBuf,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(room_manager: Arc<RoomManager>, upload_dir: PathBuf, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            room_manager,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            upload_dir,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let upload_dir = self.upload_dir.clone();

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            // Attachment retrieval is a plain path-based fetch restricted to
            // the generated-filename namespace; unknown names 404.
            .nest_service("/uploads", ServeDir::new(upload_dir))
            .fallback_service(ServeDir::new("public"))
            .with_state(self)
            .layer(CorsLayer::permissive())
            // Applied last so the policy covers the API, uploads, and the
            // static client alike.
            .layer(SetResponseHeaderLayer::overriding(
                header::CONTENT_SECURITY_POLICY,
                HeaderValue::from_static(CONTENT_SECURITY_POLICY),
            ))
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager.room_count();
    let members = server.room_manager.total_member_count();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "members": members,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.room_manager.room_count();
    let members = server.room_manager.total_member_count();
    let body = server.metrics.render_prometheus(rooms, members);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_WS_MESSAGE_BYTES)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.room_manager, server.metrics, permit)
        })
}
