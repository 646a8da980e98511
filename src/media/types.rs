#![forbid(unsafe_code)]

// Shared media types - error taxonomy, signaling descriptors, slot tags

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for pool, room and command operations.
///
/// Pool errors are fatal at startup; room-init errors abort a single
/// admission; command errors are returned to the client as an `{ error }`
/// envelope without disconnecting the socket.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("worker pool init failed: {0}")]
    WorkerInit(String),

    #[error("room init failed: {0}")]
    RoomInit(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("participant already exists: {0}")]
    DuplicateParticipant(String),

    #[error("participant already joined: {0}")]
    AlreadyJoined(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("cannot consume: {0}")]
    CannotConsume(String),

    #[error("room is reconfiguring")]
    RoomReconfiguring,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("worker request failed: {0}")]
    Worker(#[from] mediasoup::worker::RequestError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Which of the participant's two transports an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Producer,
    Consumer,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Producer => write!(f, "producer"),
            TransportKind::Consumer => write!(f, "consumer"),
        }
    }
}

/// Media slot tag carried in producer app data. Selects one of the three
/// producer slots and the matching per-peer consumer map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaTag {
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "screen-media")]
    Screen,
}

impl MediaTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaTag::Audio => "audio",
            MediaTag::Video => "video",
            MediaTag::Screen => "screen-media",
        }
    }
}

impl std::fmt::Display for MediaTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App data attached to every WebRTC transport.
#[derive(Debug, Clone)]
pub struct TransportAppData {
    pub user_id: String,
    pub kind: TransportKind,
}

/// App data attached to every producer; the observer's `volumes` callback
/// reads `user_id` back from here to name the dominant speaker.
#[derive(Debug, Clone)]
pub struct ProducerAppData {
    pub user_id: String,
    pub media_tag: MediaTag,
}

/// Transport parameters returned to the client after `createWebRtcTransport`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportDescriptor {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Consumer parameters handed to a subscriber, for both the pull reply and
/// the server-initiated `newConsumer` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub r#type: ConsumerType,
    pub producer_paused: bool,
}

impl From<&Consumer> for ConsumerDescriptor {
    fn from(consumer: &Consumer) -> Self {
        Self {
            producer_id: consumer.producer_id().to_string(),
            id: consumer.id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            r#type: consumer.r#type(),
            producer_paused: consumer.producer_paused(),
        }
    }
}

/// Per-client slice of the read-only room stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub id: String,
    pub device: String,
    pub produce_audio: bool,
    pub produce_video: bool,
}

/// Read-only room snapshot served on `GET /rooms/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub id: String,
    pub worker: usize,
    pub clients: Vec<ClientStats>,
    pub group_by_device: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_tag_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&MediaTag::Screen).unwrap(), "\"screen-media\"");
        assert_eq!(serde_json::to_string(&MediaTag::Audio).unwrap(), "\"audio\"");
        let tag: MediaTag = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(tag, MediaTag::Video);
    }

    #[test]
    fn transport_kind_round_trip() {
        let kind: TransportKind = serde_json::from_str("\"consumer\"").unwrap();
        assert_eq!(kind, TransportKind::Consumer);
        assert_eq!(serde_json::to_string(&TransportKind::Producer).unwrap(), "\"producer\"");
    }
}
