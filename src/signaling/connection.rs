#![forbid(unsafe_code)]

// WebSocket connection handler for individual participants

use crate::media::types::MediaError;
use crate::metrics::ServerMetrics;
use crate::room::{RoomRegistry, SessionInit};
use crate::signaling::protocol::{self, ClientEvent, HandshakeQuery, ServerEvent};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client. Fan-out beyond this is stale and
/// dropped early rather than buffered.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout - close the connection if nothing arrives within this window.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Correlates server-initiated requests (push `newConsumer`) with the
/// client's `ack` frames. Dropping the registry cancels every pending
/// wait, which is how a disconnect aborts in-flight push flows.
#[derive(Clone, Default)]
pub struct AckRegistry {
    inner: Arc<StdMutex<AckState>>,
}

#[derive(Default)]
struct AckState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<()>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a request id and the receiver its ack resolves.
    pub fn register(&self) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(id, tx);
        (id, rx)
    }

    /// Resolves a pending request. Unknown ids are ignored (late acks).
    pub fn resolve(&self, request_id: u64) -> bool {
        let sender = {
            let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(&request_id)
        };
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Drops a registration that will never be acknowledged.
    pub fn unregister(&self, request_id: u64) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.remove(&request_id);
    }
}

/// Handles one socket connection for its whole lifetime: ensures the room
/// exists, loops over inbound events, and dispatches the disconnect.
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    query: HandshakeQuery,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let session_id = query.session_id.clone();
    let user_id = query.user_id.clone();
    info!("socket connected: {} in session {}", user_id, session_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let room_exists = match registry.init_session(&session_id).await {
        Ok(SessionInit::AlreadyExists) => true,
        Ok(SessionInit::Created) => false,
        Err(e) => {
            warn!("session init failed for {}: {}", session_id, e);
            let mut socket = socket;
            if let Some(json) = protocol::encode(&ServerEvent::Error {
                message: format!("session init failed: {e}"),
            }) {
                let _ = socket.send(Message::Text((*json).clone().into())).await;
            }
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_events_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
    });

    let acks = AckRegistry::new();
    protocol::push(&tx, &ServerEvent::Handshake { room_exists });

    loop {
        let message = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("idle timeout for {} in session {}", user_id, session_id);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                metrics.inc_events_received();
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        handle_client_event(event, &query, &tx, &acks, &registry, &metrics).await;
                    }
                    Err(e) => {
                        warn!("invalid frame from {}: {}", user_id, e);
                        metrics.inc_errors();
                        protocol::push(&tx, &ServerEvent::Error {
                            message: format!("invalid frame: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("socket closed by {} in session {}", user_id, session_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("unexpected frame type from {}", user_id);
            }
        }
    }

    // disconnect: pending acks cancel when the registry drops, in-flight
    // work completes but its results are discarded
    registry.remove_client(&session_id, &user_id).await;

    drop(tx);
    let _ = send_task.await;
    info!("socket finished: {} in session {}", user_id, session_id);
}

async fn handle_client_event(
    event: ClientEvent,
    query: &HandshakeQuery,
    tx: &mpsc::Sender<Arc<String>>,
    acks: &AckRegistry,
    registry: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) {
    match event {
        ClientEvent::AddClient { kind } => {
            match registry.add_client(query, kind, tx.clone(), acks.clone()).await {
                Ok(()) => protocol::push(tx, &ServerEvent::AddClient { ok: true }),
                Err(e) => {
                    warn!("addClient for {} failed: {}", query.user_id, e);
                    metrics.inc_errors();
                    protocol::push(tx, &ServerEvent::Error { message: e.to_string() });
                }
            }
        }

        ClientEvent::JoinRoom { rtp_capabilities, producer_capabilities } => {
            match registry.join_room(query, rtp_capabilities, producer_capabilities).await {
                Ok(outcome) => protocol::push(tx, &ServerEvent::JoinRoom {
                    user_id: outcome.user_id,
                    peers_info: outcome.peers_info,
                }),
                Err(e) => {
                    warn!("joinRoom for {} failed: {}", query.user_id, e);
                    metrics.inc_errors();
                    protocol::push(tx, &ServerEvent::Error { message: e.to_string() });
                }
            }
        }

        ClientEvent::Media(payload) => {
            let action = payload
                .get("action")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            metrics.inc_media_commands();
            match registry.handle_media(&query.session_id, &query.user_id, payload).await {
                Ok(result) => {
                    protocol::push(tx, &ServerEvent::media_result(&action, result));
                }
                Err(e) => {
                    // command errors answer on the request channel and never
                    // disconnect the socket
                    warn!("media action {} for {} failed: {}", action, query.user_id, e);
                    metrics.inc_errors();
                    if matches!(e, MediaError::UnknownAction(_)) {
                        debug!("unknown media action from {}: {}", query.user_id, action);
                    }
                    protocol::push(tx, &ServerEvent::media_error(&action, e));
                }
            }
        }

        ClientEvent::ToggleDevice { action, kind } => {
            registry
                .toggle_device(&query.session_id, &query.user_id, action, kind)
                .await;
        }

        ClientEvent::MediaRoomClients => {
            let clients = registry.room_clients(&query.session_id).await;
            protocol::push(tx, &ServerEvent::MediaRoomClients { clients });
        }

        ClientEvent::MediaRoomInfo => {
            let stats = registry.room_stats(&query.session_id).await;
            protocol::push(tx, &ServerEvent::MediaRoomInfo { stats });
        }

        ClientEvent::MediaReconfigure => {
            if let Err(e) = registry.reconfigure_media(&query.session_id).await {
                warn!("reconfigure of {} failed: {}", query.session_id, e);
                metrics.inc_errors();
                protocol::push(tx, &ServerEvent::Error { message: e.to_string() });
            }
        }

        ClientEvent::Handshake { .. } => {
            let room_exists = registry.room_exists(&query.session_id);
            protocol::push(tx, &ServerEvent::Handshake { room_exists });
        }

        ClientEvent::Ping => {
            protocol::push(tx, &ServerEvent::Pong);
        }

        ClientEvent::Ack { request_id } => {
            if !acks.resolve(request_id) {
                debug!("late ack {} from {}", request_id, query.user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_registry_resolves_pending_request() {
        let acks = AckRegistry::new();
        let (id, rx) = acks.register();
        assert!(acks.resolve(id));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn ack_registry_ignores_unknown_and_late_acks() {
        let acks = AckRegistry::new();
        assert!(!acks.resolve(42));

        let (id, rx) = acks.register();
        acks.unregister(id);
        assert!(!acks.resolve(id));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn dropping_registry_cancels_waiters() {
        let acks = AckRegistry::new();
        let (_id, rx) = acks.register();
        drop(acks);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let acks = AckRegistry::new();
        let (a, _rx_a) = acks.register();
        let (b, _rx_b) = acks.register();
        assert_ne!(a, b);
    }
}
