#![forbid(unsafe_code)]

// Participant record - per-user media state inside a room

use crate::media::types::{ClientStats, MediaTag, TransportKind};
use crate::signaling::connection::AckRegistry;
use crate::signaling::protocol::PeerInfo;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-user state inside a room: at most one producer transport and one
/// consumer transport, up to three producers (audio, camera, screen), and
/// three per-peer consumer maps. The participant exists from `addClient`;
/// it receives fan-out only after `joinRoom`.
pub struct Participant {
    pub id: String,
    pub device: String,
    pub kind: TransportKind,
    pub sender: mpsc::Sender<Arc<String>>,
    pub acks: AckRegistry,

    pub joined: bool,
    pub rtp_capabilities: Option<RtpCapabilities>,

    pub producer_transport: Option<WebRtcTransport>,
    pub consumer_transport: Option<WebRtcTransport>,

    producer_audio: Option<Producer>,
    producer_video: Option<Producer>,
    producer_screen: Option<Producer>,

    consumers_audio: HashMap<String, Consumer>,
    consumers_video: HashMap<String, Consumer>,
    consumers_screen: HashMap<String, Consumer>,

    pub produce_audio_enabled: bool,
    pub produce_video_enabled: bool,
    pub global_audio_enabled: bool,
    pub global_video_enabled: bool,
    pub screen_sharing: bool,
}

impl Participant {
    pub fn new(
        id: String,
        device: String,
        kind: TransportKind,
        sender: mpsc::Sender<Arc<String>>,
        acks: AckRegistry,
    ) -> Self {
        Self {
            id,
            device,
            kind,
            sender,
            acks,
            joined: false,
            rtp_capabilities: None,
            producer_transport: None,
            consumer_transport: None,
            producer_audio: None,
            producer_video: None,
            producer_screen: None,
            consumers_audio: HashMap::new(),
            consumers_video: HashMap::new(),
            consumers_screen: HashMap::new(),
            produce_audio_enabled: false,
            produce_video_enabled: false,
            global_audio_enabled: true,
            global_video_enabled: true,
            screen_sharing: false,
        }
    }

    pub fn transport(&self, kind: TransportKind) -> Option<&WebRtcTransport> {
        match kind {
            TransportKind::Producer => self.producer_transport.as_ref(),
            TransportKind::Consumer => self.consumer_transport.as_ref(),
        }
    }

    pub fn set_transport(&mut self, kind: TransportKind, transport: WebRtcTransport) {
        match kind {
            TransportKind::Producer => self.producer_transport = Some(transport),
            TransportKind::Consumer => self.consumer_transport = Some(transport),
        }
    }

    pub fn take_transport(&mut self, kind: TransportKind) -> Option<WebRtcTransport> {
        match kind {
            TransportKind::Producer => self.producer_transport.take(),
            TransportKind::Consumer => self.consumer_transport.take(),
        }
    }

    pub fn producer(&self, tag: MediaTag) -> Option<&Producer> {
        match tag {
            MediaTag::Audio => self.producer_audio.as_ref(),
            MediaTag::Video => self.producer_video.as_ref(),
            MediaTag::Screen => self.producer_screen.as_ref(),
        }
    }

    pub fn set_producer(&mut self, tag: MediaTag, producer: Producer) {
        match tag {
            MediaTag::Audio => self.producer_audio = Some(producer),
            MediaTag::Video => self.producer_video = Some(producer),
            MediaTag::Screen => {
                self.producer_screen = Some(producer);
                self.screen_sharing = true;
            }
        }
    }

    pub fn take_producer(&mut self, tag: MediaTag) -> Option<Producer> {
        match tag {
            MediaTag::Audio => self.producer_audio.take(),
            MediaTag::Video => self.producer_video.take(),
            MediaTag::Screen => {
                self.screen_sharing = false;
                self.producer_screen.take()
            }
        }
    }

    pub fn consumers(&self, tag: MediaTag) -> &HashMap<String, Consumer> {
        match tag {
            MediaTag::Audio => &self.consumers_audio,
            MediaTag::Video => &self.consumers_video,
            MediaTag::Screen => &self.consumers_screen,
        }
    }

    pub fn consumers_mut(&mut self, tag: MediaTag) -> &mut HashMap<String, Consumer> {
        match tag {
            MediaTag::Audio => &mut self.consumers_audio,
            MediaTag::Video => &mut self.consumers_video,
            MediaTag::Screen => &mut self.consumers_screen,
        }
    }

    /// Number of live producer slots
    pub fn producer_count(&self) -> usize {
        [
            self.producer_audio.is_some(),
            self.producer_video.is_some(),
            self.producer_screen.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    pub fn produce_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.produce_audio_enabled,
            MediaKind::Video => self.produce_video_enabled,
        }
    }

    pub fn set_produce_enabled(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.produce_audio_enabled = enabled,
            MediaKind::Video => self.produce_video_enabled = enabled,
        }
    }

    pub fn global_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.global_audio_enabled,
            MediaKind::Video => self.global_video_enabled,
        }
    }

    /// Tears down all worker handles in the contract order: producers
    /// first, then consumers, then both transports. Handles close on drop;
    /// dependent peers' consumers are cleaned up via their own
    /// `producerclose` callbacks.
    pub fn close_media(&mut self) {
        drop(self.producer_audio.take());
        drop(self.producer_video.take());
        drop(self.producer_screen.take());
        self.screen_sharing = false;

        self.consumers_audio.clear();
        self.consumers_video.clear();
        self.consumers_screen.clear();

        drop(self.producer_transport.take());
        drop(self.consumer_transport.take());
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            kind: self.kind,
            screen_sharing: self.screen_sharing,
        }
    }

    pub fn client_stats(&self) -> ClientStats {
        ClientStats {
            id: self.id.clone(),
            device: self.device.clone(),
            produce_audio: self.producer_audio.is_some(),
            produce_video: self.producer_video.is_some(),
        }
    }
}
