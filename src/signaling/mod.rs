#![forbid(unsafe_code)]

// Signaling module - socket gateway and read-only HTTP surface

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use protocol::HandshakeQuery;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Socket gateway plus the operational read-only endpoints. The gateway
/// never touches producers or consumers directly; it only calls room-level
/// operations on the registry.
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(registry: Arc<RoomRegistry>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("max connections: {}", max_connections);

        Self {
            registry,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Builds the axum router: the ws endpoint, healthcheck, metrics and
    /// the read-only room stats.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/rooms/stats", get(rooms_stats_handler))
            .route("/rooms/{id}/stats", get(room_stats_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Binds and serves until the process shuts down
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("signaling server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Health check: room and participant counts at a glance
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let participants = server.registry.participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

/// Prometheus text exposition of the process counters plus pool slots
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.registry.room_count();
    let participants = server.registry.participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants, server.registry.pool());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// GET /rooms/stats - snapshot of every live room
async fn rooms_stats_handler(State(server): State<SignalingServer>) -> Response {
    Json(server.registry.all_stats().await).into_response()
}

/// GET /rooms/{id}/stats - one room or 404
async fn room_stats_handler(
    State(server): State<SignalingServer>,
    Path(id): Path<String>,
) -> Response {
    match server.registry.room_stats(&id).await {
        Some(stats) => Json(stats).into_response(),
        None => (StatusCode::NOT_FOUND, "room not found").into_response(),
    }
}

/// WebSocket upgrade: validates the handshake query, enforces the
/// connection cap, then hands the socket to the connection loop.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HandshakeQuery>,
    State(server): State<SignalingServer>,
) -> Response {
    if query.user_id.is_empty() || query.session_id.is_empty() || query.device.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId, sessionId and device are required")
            .into_response();
    }

    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("connection limit reached, rejecting upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("socket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.registry,
                query,
                server.metrics,
                permit,
            )
        })
}
