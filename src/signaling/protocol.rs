#![forbid(unsafe_code)]

// Signaling protocol - socket framing for inbound and outbound events

use crate::media::types::{ConsumerDescriptor, MediaTag, RoomStats, TransportKind};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handshake query parsed from the upgrade request.
/// All fields are required; a malformed query is rejected before upgrade.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    pub user_id: String,
    pub session_id: String,
    pub device: String,
    pub kind: TransportKind,
}

/// The four enable flags sent alongside `joinRoom`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerCapabilities {
    pub producer_audio_enabled: bool,
    pub producer_video_enabled: bool,
    pub global_audio_enabled: bool,
    pub global_video_enabled: bool,
}

/// Peer summary returned from `joinRoom` and `mediaRoomClients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub kind: TransportKind,
    pub screen_sharing: bool,
}

/// Client-to-server events
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Join the session's broadcast group and receive existing peers
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        rtp_capabilities: RtpCapabilities,
        producer_capabilities: ProducerCapabilities,
    },
    /// Pre-join admission of this connection's participant record
    AddClient {
        kind: TransportKind,
    },
    /// Media command envelope; the inner value carries `action` and `data`
    Media(serde_json::Value),
    /// Pure relay to the rest of the room
    ToggleDevice {
        action: String,
        kind: String,
    },
    /// Read-only list of room members
    MediaRoomClients,
    /// Read-only room stats snapshot
    MediaRoomInfo,
    /// Move the room to a freshly selected worker
    MediaReconfigure,
    /// Re-check room existence
    Handshake {
        #[serde(default)]
        kind: Option<TransportKind>,
    },
    Ping,
    /// Transport-level acknowledgement of a server-initiated request
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: u64,
    },
}

/// The closed action set of the media command dispatcher. An inbound action
/// outside this list fails with `UnknownAction`.
pub const MEDIA_ACTIONS: [&str; 18] = [
    "getRouterRtpCapabilities",
    "createWebRtcTransport",
    "connectWebRtcTransport",
    "produce",
    "consume",
    "restartIce",
    "requestConsumerKeyFrame",
    "getTransportStats",
    "getProducerStats",
    "getConsumerStats",
    "getAudioProducerIds",
    "getVideoProducerIds",
    "producerClose",
    "producerPause",
    "producerResume",
    "allProducerClose",
    "allProducerPause",
    "allProducerResume",
];

/// App data the client attaches to `produce`; names the target slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAppData {
    pub media_tag: MediaTag,
}

/// Media commands, dispatched by the room with an exhaustive match.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum MediaCommand {
    GetRouterRtpCapabilities,
    CreateWebRtcTransport {
        kind: TransportKind,
    },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        dtls_parameters: DtlsParameters,
        kind: TransportKind,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ProduceAppData,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        user_id: String,
        kind: MediaTag,
    },
    RestartIce {
        kind: TransportKind,
    },
    #[serde(rename_all = "camelCase")]
    RequestConsumerKeyFrame {
        user_id: String,
        kind: MediaTag,
    },
    GetTransportStats {
        kind: TransportKind,
    },
    GetProducerStats {
        kind: MediaTag,
    },
    #[serde(rename_all = "camelCase")]
    GetConsumerStats {
        user_id: String,
        kind: MediaTag,
    },
    GetAudioProducerIds,
    GetVideoProducerIds,
    #[serde(rename_all = "camelCase")]
    ProducerClose {
        user_id: String,
        kind: MediaKind,
        #[serde(default)]
        is_screen_media: bool,
    },
    #[serde(rename_all = "camelCase")]
    ProducerPause {
        user_id: String,
        kind: MediaKind,
        #[serde(default)]
        is_global: bool,
    },
    #[serde(rename_all = "camelCase")]
    ProducerResume {
        user_id: String,
        kind: MediaKind,
        #[serde(default)]
        is_global: bool,
    },
    AllProducerClose {
        kind: MediaKind,
    },
    AllProducerPause {
        kind: MediaKind,
    },
    AllProducerResume {
        kind: MediaKind,
    },
}

/// Server-to-client events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Connect-time reply: whether the session's room already existed
    #[serde(rename_all = "camelCase")]
    Handshake { room_exists: bool },
    /// Reply to `joinRoom`
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        user_id: String,
        peers_info: Vec<PeerInfo>,
    },
    /// Reply to `addClient`
    AddClient { ok: bool },
    /// Reply envelope for media commands; exactly one of result/error is set
    #[serde(rename_all = "camelCase")]
    Media {
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MediaRoomClients { clients: Vec<PeerInfo> },
    MediaRoomInfo { stats: Option<RoomStats> },
    Pong,
    Error { message: String },

    // Room-wide notifications
    #[serde(rename_all = "camelCase")]
    MediaClientConnected { user_id: String },
    #[serde(rename_all = "camelCase")]
    MediaClientDisconnect { user_id: String },
    #[serde(rename_all = "camelCase")]
    MediaDisconnectMember { user_id: String },
    #[serde(rename_all = "camelCase")]
    MediaProduce { user_id: String, media_tag: MediaTag },
    #[serde(rename_all = "camelCase")]
    MediaProducerClose { user_id: String, media_tag: MediaTag },
    #[serde(rename_all = "camelCase")]
    MediaProducerPause {
        user_id: String,
        media_tag: MediaTag,
        is_global: bool,
    },
    #[serde(rename_all = "camelCase")]
    MediaProducerResume {
        user_id: String,
        media_tag: MediaTag,
        is_global: bool,
    },
    /// Sent to a producer's owner when a command hits a closed producer
    MediaReproduce { kind: MediaTag },
    MediaReconfigure,
    #[serde(rename_all = "camelCase")]
    MediaVideoOrientationChange {
        user_id: String,
        camera: bool,
        flip: bool,
        rotation: u16,
    },
    #[serde(rename_all = "camelCase")]
    MediaActiveSpeaker {
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<i8>,
    },
    ToggleDevice {
        sender: String,
        action: String,
        kind: String,
    },

    // Per-subscriber notifications
    #[serde(rename_all = "camelCase")]
    NewConsumer {
        request_id: u64,
        user_id: String,
        media_tag: MediaTag,
        consumer: ConsumerDescriptor,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { user_id: String, media_tag: MediaTag },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { user_id: String, media_tag: MediaTag },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { user_id: String, media_tag: MediaTag },
    #[serde(rename_all = "camelCase")]
    ConsumerScore {
        user_id: String,
        media_tag: MediaTag,
        score: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumersLayersChanged {
        user_id: String,
        media_tag: MediaTag,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
}

impl ServerEvent {
    /// Media reply carrying a result payload
    pub fn media_result(action: &str, result: serde_json::Value) -> Self {
        ServerEvent::Media {
            action: action.to_string(),
            result: Some(result),
            error: None,
        }
    }

    /// Media reply carrying the `{ error }` envelope
    pub fn media_error(action: &str, error: impl std::fmt::Display) -> Self {
        ServerEvent::Media {
            action: action.to_string(),
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Serializes an event once for fan-out to many sockets.
pub fn encode(event: &ServerEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("failed to serialize server event: {}", e);
            None
        }
    }
}

/// Pushes one event to one socket channel; full or closed channels drop the
/// frame rather than block (the subscriber is lagging or already gone).
pub fn push(sender: &mpsc::Sender<Arc<String>>, event: &ServerEvent) {
    if let Some(json) = encode(event) {
        match sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("socket channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("socket channel closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_action_set_matches_dispatcher_tags() {
        assert_eq!(MEDIA_ACTIONS.len(), 18);
        assert!(!MEDIA_ACTIONS.contains(&"selfDestruct"));

        // tags without payloads deserialize straight into their commands
        for action in ["getRouterRtpCapabilities", "getAudioProducerIds", "getVideoProducerIds"] {
            assert!(MEDIA_ACTIONS.contains(&action));
            let cmd: Result<MediaCommand, _> =
                serde_json::from_value(serde_json::json!({ "action": action }));
            assert!(cmd.is_ok(), "{action} failed to parse");
        }

        // payload-carrying tags parse from their wire shape
        let cmd: MediaCommand = serde_json::from_value(serde_json::json!({
            "action": "consume",
            "data": { "userId": "peer-1", "kind": "screen-media" },
        }))
        .unwrap();
        assert!(matches!(
            cmd,
            MediaCommand::Consume { kind: MediaTag::Screen, .. }
        ));

        let cmd: MediaCommand = serde_json::from_value(serde_json::json!({
            "action": "producerClose",
            "data": { "userId": "peer-1", "kind": "video", "isScreenMedia": true },
        }))
        .unwrap();
        assert!(matches!(cmd, MediaCommand::ProducerClose { is_screen_media: true, .. }));
    }

    #[test]
    fn unit_commands_parse_without_data() {
        let cmd: MediaCommand =
            serde_json::from_value(serde_json::json!({ "action": "getRouterRtpCapabilities" }))
                .unwrap();
        assert!(matches!(cmd, MediaCommand::GetRouterRtpCapabilities));
    }

    #[test]
    fn producer_pause_defaults_to_non_global() {
        let cmd: MediaCommand = serde_json::from_value(serde_json::json!({
            "action": "producerPause",
            "data": { "userId": "u1", "kind": "audio" },
        }))
        .unwrap();
        match cmd {
            MediaCommand::ProducerPause { user_id, is_global, .. } => {
                assert_eq!(user_id, "u1");
                assert!(!is_global);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn client_events_parse_from_tagged_frames() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ping));

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"ack","data":{"requestId":7}}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ack { request_id: 7 }));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"toggleDevice","data":{"action":"pause","kind":"video"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::ToggleDevice { .. }));
    }

    #[test]
    fn active_speaker_serializes_null_user_on_silence() {
        let json = serde_json::to_value(&ServerEvent::MediaActiveSpeaker {
            user_id: None,
            volume: None,
        })
        .unwrap();
        assert_eq!(json["event"], "mediaActiveSpeaker");
        assert!(json["data"]["userId"].is_null());
    }
}
