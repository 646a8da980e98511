#![forbid(unsafe_code)]

// Media command dispatcher and producer/consumer lifecycle

use crate::media::types::{
    ConsumerDescriptor, MediaError, MediaResult, MediaTag, ProducerAppData, TransportAppData,
    TransportDescriptor, TransportKind,
};
use crate::room::{json, Room, RoomEvent, RoomRegistry};
use crate::signaling::protocol::{self, MediaCommand, ServerEvent, MEDIA_ACTIONS};
use anyhow::anyhow;
use mediasoup::data_structures::{AppData, DtlsState};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, warn};

/// Ack window for server-initiated `newConsumer` requests.
const ACK_TIMEOUT: Duration = Duration::from_secs(20);
const ACK_ATTEMPTS: usize = 3;

fn media_tag_for(kind: MediaKind) -> MediaTag {
    match kind {
        MediaKind::Audio => MediaTag::Audio,
        MediaKind::Video => MediaTag::Video,
    }
}

impl RoomRegistry {
    /// Entry point for the `media` socket event: validates the action
    /// against the closed set, deserializes the command, and dispatches it
    /// under the room's write lock so commands in one room never
    /// interleave.
    pub async fn handle_media(
        &self,
        session_id: &str,
        user_id: &str,
        payload: Value,
    ) -> MediaResult<Value> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !MEDIA_ACTIONS.contains(&action.as_str()) {
            return Err(MediaError::UnknownAction(action));
        }

        let command: MediaCommand = serde_json::from_value(payload)
            .map_err(|e| MediaError::Other(anyhow!("invalid {action} payload: {e}")))?;

        let room_lock = self.room(session_id)?;
        let mut room = room_lock.write().await;
        if room.reconfiguring {
            return Err(MediaError::RoomReconfiguring);
        }
        room.dispatch(&room_lock, user_id, command).await
    }
}

impl Room {
    pub(crate) async fn dispatch(
        &mut self,
        room_lock: &Arc<TokioRwLock<Room>>,
        user_id: &str,
        command: MediaCommand,
    ) -> MediaResult<Value> {
        match command {
            MediaCommand::GetRouterRtpCapabilities => json(self.router.rtp_capabilities()),
            MediaCommand::CreateWebRtcTransport { kind } => {
                self.create_webrtc_transport(user_id, kind).await
            }
            MediaCommand::ConnectWebRtcTransport { dtls_parameters, kind } => {
                self.connect_webrtc_transport(user_id, kind, dtls_parameters).await
            }
            MediaCommand::Produce { kind, rtp_parameters, app_data } => {
                self.produce(room_lock, user_id, kind, rtp_parameters, app_data.media_tag)
                    .await
            }
            MediaCommand::Consume { user_id: peer_id, kind } => {
                self.consume(user_id, &peer_id, kind).await
            }
            MediaCommand::RestartIce { kind } => self.restart_ice(user_id, kind).await,
            MediaCommand::RequestConsumerKeyFrame { user_id: peer_id, kind } => {
                self.request_consumer_key_frame(user_id, &peer_id, kind).await
            }
            MediaCommand::GetTransportStats { kind } => {
                self.get_transport_stats(user_id, kind).await
            }
            MediaCommand::GetProducerStats { kind } => {
                self.get_producer_stats(user_id, kind).await
            }
            MediaCommand::GetConsumerStats { user_id: peer_id, kind } => {
                self.get_consumer_stats(user_id, &peer_id, kind).await
            }
            MediaCommand::GetAudioProducerIds => Ok(self.producer_ids(MediaTag::Audio)),
            MediaCommand::GetVideoProducerIds => Ok(self.producer_ids(MediaTag::Video)),
            MediaCommand::ProducerClose { user_id: target, kind, is_screen_media } => {
                let tag = if is_screen_media { MediaTag::Screen } else { media_tag_for(kind) };
                self.producer_close(&target, tag).await
            }
            MediaCommand::ProducerPause { user_id: target, kind, is_global } => {
                self.producer_pause(&target, kind, is_global).await
            }
            MediaCommand::ProducerResume { user_id: target, kind, is_global } => {
                self.producer_resume(&target, kind, is_global).await
            }
            MediaCommand::AllProducerClose { kind } => self.all_producer_close(kind).await,
            MediaCommand::AllProducerPause { kind } => self.all_producer_pause(kind).await,
            MediaCommand::AllProducerResume { kind } => self.all_producer_resume(kind).await,
        }
    }

    /// Creates the participant's producer or consumer transport from the
    /// configured listen IPs, with UDP preferred and SCTP enabled.
    async fn create_webrtc_transport(
        &mut self,
        user_id: &str,
        kind: TransportKind,
    ) -> MediaResult<Value> {
        if !self.participants.contains_key(user_id) {
            return Err(MediaError::ParticipantNotFound(user_id.to_string()));
        }

        let mut options = self.config.webrtc_transport.to_transport_options();
        options.app_data = AppData::new(TransportAppData {
            user_id: user_id.to_string(),
            kind,
        });

        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| anyhow!("create {kind} transport: {e}"))?;

        transport
            .on_dtls_state_change({
                let events = self.events.clone();
                let user_id = user_id.to_string();
                move |state| {
                    if matches!(state, DtlsState::Closed | DtlsState::Failed) {
                        let _ = events.send(RoomEvent::TransportClosed {
                            user_id: user_id.clone(),
                            kind,
                        });
                    }
                }
            })
            .detach();

        if let Some(initial) = self.config.webrtc_transport.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(initial).await {
                warn!("initial max incoming bitrate on {}: {}", transport.id(), e);
            }
        }

        let descriptor = TransportDescriptor::from(&transport);
        debug!("room {}: created {} transport {} for {}", self.id, kind, descriptor.id, user_id);

        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        participant.set_transport(kind, transport);

        self.update_incoming_bitrate().await;
        json(&descriptor)
    }

    async fn connect_webrtc_transport(
        &mut self,
        user_id: &str,
        kind: TransportKind,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let transport = participant
            .transport(kind)
            .ok_or_else(|| MediaError::TransportNotFound(format!("{kind} transport of {user_id}")))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| anyhow!("connect {kind} transport: {e}"))?;

        debug!("room {}: connected {} transport for {}", self.id, kind, user_id);
        Ok(json!({ "connected": true }))
    }

    /// Creates a producer on the participant's producer transport, stores
    /// it in the slot named by the media tag, and fans consumers out to
    /// every joined peer. Audio and camera video start paused (the client
    /// resumes once its UI is ready); screen-share stays live.
    async fn produce(
        &mut self,
        room_lock: &Arc<TokioRwLock<Room>>,
        user_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        tag: MediaTag,
    ) -> MediaResult<Value> {
        let transport = {
            let participant = self
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            participant
                .transport(TransportKind::Producer)
                .cloned()
                .ok_or_else(|| {
                    MediaError::TransportNotFound(format!("producer transport of {user_id}"))
                })?
        };

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.app_data = AppData::new(ProducerAppData {
            user_id: user_id.to_string(),
            media_tag: tag,
        });

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| anyhow!("produce {tag}: {e}"))?;

        if kind == MediaKind::Video {
            producer
                .on_video_orientation_change({
                    let group = self.group.clone();
                    let user_id = user_id.to_string();
                    move |orientation| {
                        group.broadcast_all(&ServerEvent::MediaVideoOrientationChange {
                            user_id: user_id.clone(),
                            camera: orientation.camera,
                            flip: orientation.flip,
                            rotation: orientation.rotation,
                        });
                    }
                })
                .detach();
        }

        producer
            .on_score({
                let user_id = user_id.to_string();
                move |score| {
                    debug!("producer score for {} ({}): {:?}", user_id, tag, score);
                }
            })
            .detach();

        if tag == MediaTag::Audio {
            self.audio_observer
                .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                .await
                .map_err(|e| anyhow!("register audio producer with observer: {e}"))?;
        }

        // audio and camera start paused until the client resumes them;
        // screen-share is expected to be visible immediately
        if tag != MediaTag::Screen {
            producer
                .pause()
                .await
                .map_err(|e| anyhow!("pause fresh {tag} producer: {e}"))?;
        }

        let producer_id = producer.id().to_string();
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        participant.set_producer(tag, producer);

        self.group.broadcast(user_id, &ServerEvent::MediaProduce {
            user_id: user_id.to_string(),
            media_tag: tag,
        });

        let subscribers: Vec<String> = self
            .participants
            .iter()
            .filter(|(id, peer)| id.as_str() != user_id && peer.joined)
            .map(|(id, _)| id.clone())
            .collect();
        for subscriber in subscribers {
            schedule_push_consumer(room_lock.clone(), user_id.to_string(), subscriber, tag);
        }

        self.update_incoming_bitrate().await;
        debug!("room {}: {} produced {} ({})", self.id, user_id, tag, producer_id);
        Ok(json!({ "id": producer_id }))
    }

    /// Client-initiated pull consume. Idempotent: a second consume for the
    /// same peer and tag returns the existing consumer's descriptor.
    async fn consume(
        &mut self,
        user_id: &str,
        peer_id: &str,
        tag: MediaTag,
    ) -> MediaResult<Value> {
        let producer = {
            let peer = self
                .participants
                .get(peer_id)
                .ok_or_else(|| MediaError::CannotConsume(format!("no such peer {peer_id}")))?;
            peer.producer(tag)
                .cloned()
                .ok_or_else(|| MediaError::CannotConsume(format!("{peer_id} has no {tag} producer")))?
        };

        let (transport, rtp_capabilities, sender) = {
            let participant = self
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;

            if let Some(existing) = participant.consumers(tag).get(peer_id) {
                return json(&ConsumerDescriptor::from(existing));
            }

            let rtp_capabilities = participant
                .rtp_capabilities
                .clone()
                .ok_or_else(|| MediaError::CannotConsume("missing rtp capabilities".to_string()))?;
            let transport = participant
                .transport(TransportKind::Consumer)
                .cloned()
                .ok_or_else(|| {
                    MediaError::TransportNotFound(format!("consumer transport of {user_id}"))
                })?;
            (transport, rtp_capabilities, participant.sender.clone())
        };

        if !self.router.can_consume(&producer.id(), &rtp_capabilities) {
            return Err(MediaError::CannotConsume(format!(
                "incompatible rtp capabilities for {tag} of {peer_id}"
            )));
        }

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        options.paused = producer.paused();
        if producer.kind() == MediaKind::Video {
            options.preferred_layers = Some(ConsumerLayers {
                spatial_layer: 2,
                temporal_layer: Some(2),
            });
        }

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| anyhow!("consume {tag} of {peer_id}: {e}"))?;

        wire_consumer(&consumer, user_id, peer_id, tag, sender, self.events.clone());

        if consumer.kind() == MediaKind::Video {
            consumer
                .resume()
                .await
                .map_err(|e| anyhow!("resume video consumer: {e}"))?;
        }

        let descriptor = ConsumerDescriptor::from(&consumer);
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        participant.consumers_mut(tag).insert(peer_id.to_string(), consumer);

        debug!("room {}: {} pull-consumes {} of {}", self.id, user_id, tag, peer_id);
        json(&descriptor)
    }

    async fn restart_ice(&mut self, user_id: &str, kind: TransportKind) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let transport = participant
            .transport(kind)
            .ok_or_else(|| MediaError::TransportNotFound(format!("{kind} transport of {user_id}")))?;

        let ice_parameters = transport
            .restart_ice()
            .await
            .map_err(|e| anyhow!("restart ice: {e}"))?;
        json(&ice_parameters)
    }

    async fn request_consumer_key_frame(
        &mut self,
        user_id: &str,
        peer_id: &str,
        tag: MediaTag,
    ) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let consumer = participant
            .consumers(tag)
            .get(peer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(format!("{tag} of {peer_id}")))?;

        consumer
            .request_key_frame()
            .await
            .map_err(|e| anyhow!("request key frame: {e}"))?;
        Ok(json!({ "requested": true }))
    }

    async fn get_transport_stats(&mut self, user_id: &str, kind: TransportKind) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let transport = participant
            .transport(kind)
            .ok_or_else(|| MediaError::TransportNotFound(format!("{kind} transport of {user_id}")))?;

        let stats = transport
            .get_stats()
            .await
            .map_err(|e| anyhow!("transport stats: {e}"))?;
        json(&stats)
    }

    async fn get_producer_stats(&mut self, user_id: &str, tag: MediaTag) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let producer = participant
            .producer(tag)
            .ok_or_else(|| MediaError::ProducerNotFound(format!("{tag} of {user_id}")))?;

        let stats = producer
            .get_stats()
            .await
            .map_err(|e| anyhow!("producer stats: {e}"))?;
        json(&stats)
    }

    async fn get_consumer_stats(
        &mut self,
        user_id: &str,
        peer_id: &str,
        tag: MediaTag,
    ) -> MediaResult<Value> {
        let participant = self
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        let consumer = participant
            .consumers(tag)
            .get(peer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(format!("{tag} of {peer_id}")))?;

        let stats = consumer
            .get_stats()
            .await
            .map_err(|e| anyhow!("consumer stats: {e}"))?;
        json(&stats)
    }

    fn producer_ids(&self, tag: MediaTag) -> Value {
        let ids: Vec<String> = self
            .participants
            .values()
            .filter_map(|p| p.producer(tag).map(|producer| producer.id().to_string()))
            .collect();
        json!(ids)
    }

    /// Pauses a participant's producer. A non-global pause against a
    /// participant whose global flag for that kind is already off is a
    /// no-op: the media is globally muted and this pause is redundant.
    async fn producer_pause(
        &mut self,
        target: &str,
        kind: MediaKind,
        is_global: bool,
    ) -> MediaResult<Value> {
        let tag = media_tag_for(kind);
        let participant = self
            .participants
            .get_mut(target)
            .ok_or_else(|| MediaError::ParticipantNotFound(target.to_string()))?;

        if !is_global && !participant.global_enabled(kind) {
            debug!("room {}: {} pause of {} suppressed by global mute", self.id, tag, target);
            return Ok(json!({ "paused": false }));
        }

        let producer = participant
            .producer(tag)
            .ok_or_else(|| MediaError::ProducerNotFound(format!("{tag} of {target}")))?;
        if !producer.paused() {
            producer
                .pause()
                .await
                .map_err(|e| anyhow!("pause {tag} producer: {e}"))?;
        }
        participant.set_produce_enabled(kind, false);

        self.group.broadcast_all(&ServerEvent::MediaProducerPause {
            user_id: target.to_string(),
            media_tag: tag,
            is_global,
        });
        Ok(json!({ "paused": true }))
    }

    /// Resumes a participant's producer. A closed producer cannot be
    /// resumed; producer-kind owners are asked to publish again instead.
    async fn producer_resume(
        &mut self,
        target: &str,
        kind: MediaKind,
        is_global: bool,
    ) -> MediaResult<Value> {
        let tag = media_tag_for(kind);
        let participant = self
            .participants
            .get_mut(target)
            .ok_or_else(|| MediaError::ParticipantNotFound(target.to_string()))?;

        if !is_global && !participant.global_enabled(kind) {
            debug!("room {}: {} resume of {} suppressed by global mute", self.id, tag, target);
            return Ok(json!({ "resumed": false }));
        }

        let closed = match participant.producer(tag) {
            Some(producer) => producer.closed(),
            None => participant.kind == TransportKind::Producer,
        };
        if closed {
            participant.take_producer(tag);
            self.group.notify(target, &ServerEvent::MediaReproduce { kind: tag });
            return Ok(json!({ "resumed": false, "reproduce": true }));
        }

        let producer = participant
            .producer(tag)
            .ok_or_else(|| MediaError::ProducerNotFound(format!("{tag} of {target}")))?;
        if producer.paused() {
            producer
                .resume()
                .await
                .map_err(|e| anyhow!("resume {tag} producer: {e}"))?;
        }
        participant.set_produce_enabled(kind, true);

        self.group.broadcast_all(&ServerEvent::MediaProducerResume {
            user_id: target.to_string(),
            media_tag: tag,
            is_global,
        });
        Ok(json!({ "resumed": true }))
    }

    /// Closes a producer slot: dependent consumers on every peer first,
    /// then the producer itself.
    async fn producer_close(&mut self, target: &str, tag: MediaTag) -> MediaResult<Value> {
        if !self.participants.contains_key(target) {
            return Err(MediaError::ParticipantNotFound(target.to_string()));
        }

        self.close_consumers_of(target, tag);

        let participant = self
            .participants
            .get_mut(target)
            .ok_or_else(|| MediaError::ParticipantNotFound(target.to_string()))?;
        let had_producer = participant.take_producer(tag).is_some();

        self.group.broadcast_all(&ServerEvent::MediaProducerClose {
            user_id: target.to_string(),
            media_tag: tag,
        });

        if had_producer {
            self.update_incoming_bitrate().await;
        }
        Ok(json!({ "closed": had_producer }))
    }

    /// Drops every peer's consumer of `target`'s producer for the tag,
    /// notifying each subscriber.
    fn close_consumers_of(&mut self, target: &str, tag: MediaTag) {
        for (id, peer) in self.participants.iter_mut() {
            if id == target {
                continue;
            }
            if peer.consumers_mut(tag).remove(target).is_some() {
                protocol::push(&peer.sender, &ServerEvent::ConsumerClosed {
                    user_id: target.to_string(),
                    media_tag: tag,
                });
            }
        }
    }

    async fn all_producer_close(&mut self, kind: MediaKind) -> MediaResult<Value> {
        let tag = media_tag_for(kind);
        let targets: Vec<String> = self
            .participants
            .iter()
            .filter(|(_, p)| p.producer(tag).is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for target in &targets {
            self.close_consumers_of(target, tag);
            if let Some(participant) = self.participants.get_mut(target) {
                participant.take_producer(tag);
            }
            self.group.broadcast_all(&ServerEvent::MediaProducerClose {
                user_id: target.clone(),
                media_tag: tag,
            });
        }

        self.update_incoming_bitrate().await;
        Ok(json!({ "closed": targets.len() }))
    }

    /// Room-wide pause: the global mute. Flips the global flag so that
    /// per-user resumes stay suppressed until the room-wide resume.
    async fn all_producer_pause(&mut self, kind: MediaKind) -> MediaResult<Value> {
        let tag = media_tag_for(kind);
        let targets: Vec<String> = self.participants.keys().cloned().collect();
        let mut paused = 0usize;

        for target in targets {
            let Some(participant) = self.participants.get_mut(&target) else {
                continue;
            };
            match kind {
                MediaKind::Audio => participant.global_audio_enabled = false,
                MediaKind::Video => participant.global_video_enabled = false,
            }
            let Some(producer) = participant.producer(tag) else {
                continue;
            };
            if producer.closed() {
                self.group.notify(&target, &ServerEvent::MediaReproduce { kind: tag });
                continue;
            }
            if !producer.paused() {
                if let Err(e) = producer.pause().await {
                    warn!("room {}: pause {} of {}: {}", self.id, tag, target, e);
                    continue;
                }
            }
            participant.set_produce_enabled(kind, false);
            paused += 1;
            self.group.broadcast_all(&ServerEvent::MediaProducerPause {
                user_id: target.clone(),
                media_tag: tag,
                is_global: true,
            });
        }

        Ok(json!({ "paused": paused }))
    }

    /// Room-wide resume, symmetric to the room-wide pause. Participants
    /// whose producer is closed are asked to publish again.
    async fn all_producer_resume(&mut self, kind: MediaKind) -> MediaResult<Value> {
        let tag = media_tag_for(kind);
        let targets: Vec<String> = self.participants.keys().cloned().collect();
        let mut resumed = 0usize;

        for target in targets {
            let Some(participant) = self.participants.get_mut(&target) else {
                continue;
            };
            match kind {
                MediaKind::Audio => participant.global_audio_enabled = true,
                MediaKind::Video => participant.global_video_enabled = true,
            }
            let closed = match participant.producer(tag) {
                Some(producer) => producer.closed(),
                None => participant.kind == TransportKind::Producer,
            };
            if closed {
                participant.take_producer(tag);
                self.group.notify(&target, &ServerEvent::MediaReproduce { kind: tag });
                continue;
            }
            let Some(producer) = participant.producer(tag) else {
                continue;
            };
            if producer.paused() {
                if let Err(e) = producer.resume().await {
                    warn!("room {}: resume {} of {}: {}", self.id, tag, target, e);
                    continue;
                }
            }
            participant.set_produce_enabled(kind, true);
            resumed += 1;
            self.group.broadcast_all(&ServerEvent::MediaProducerResume {
                user_id: target.clone(),
                media_tag: tag,
                is_global: true,
            });
        }

        Ok(json!({ "resumed": resumed }))
    }
}

/// Wires a consumer's lifecycle events to its subscriber and the room
/// event pump. Callbacks run on the mediasoup event thread; they only
/// push frames and raise pump signals, and never panic.
pub(crate) fn wire_consumer(
    consumer: &Consumer,
    owner: &str,
    peer: &str,
    tag: MediaTag,
    sender: mpsc::Sender<Arc<String>>,
    events: mpsc::UnboundedSender<RoomEvent>,
) {
    let owner = owner.to_string();
    let peer = peer.to_string();

    consumer
        .on_transport_close({
            let events = events.clone();
            let owner = owner.clone();
            let peer = peer.clone();
            move || {
                let _ = events.send(RoomEvent::ConsumerGone { owner, peer, tag });
            }
        })
        .detach();

    consumer
        .on_producer_close({
            let sender = sender.clone();
            let owner = owner.clone();
            let peer = peer.clone();
            move || {
                protocol::push(&sender, &ServerEvent::MediaProducerClose {
                    user_id: peer.clone(),
                    media_tag: tag,
                });
                protocol::push(&sender, &ServerEvent::ConsumerClosed {
                    user_id: peer.clone(),
                    media_tag: tag,
                });
                let _ = events.send(RoomEvent::ConsumerGone { owner, peer, tag });
            }
        })
        .detach();

    consumer
        .on_producer_pause({
            let sender = sender.clone();
            let peer = peer.clone();
            move || {
                protocol::push(&sender, &ServerEvent::ConsumerPaused {
                    user_id: peer.clone(),
                    media_tag: tag,
                });
            }
        })
        .detach();

    consumer
        .on_producer_resume({
            let sender = sender.clone();
            let peer = peer.clone();
            move || {
                protocol::push(&sender, &ServerEvent::ConsumerResumed {
                    user_id: peer.clone(),
                    media_tag: tag,
                });
            }
        })
        .detach();

    consumer
        .on_score({
            let sender = sender.clone();
            let peer = peer.clone();
            move |score| {
                protocol::push(&sender, &ServerEvent::ConsumerScore {
                    user_id: peer.clone(),
                    media_tag: tag,
                    score: serde_json::to_value(score).unwrap_or(Value::Null),
                });
            }
        })
        .detach();

    if consumer.kind() == MediaKind::Video {
        consumer
            .on_layers_change({
                let sender = sender.clone();
                let peer = peer.clone();
                move |layers| {
                    protocol::push(&sender, &ServerEvent::ConsumersLayersChanged {
                        user_id: peer.clone(),
                        media_tag: tag,
                        spatial_layer: layers.as_ref().map(|l| l.spatial_layer),
                        temporal_layer: layers.as_ref().and_then(|l| l.temporal_layer),
                    });
                }
            })
            .detach();
    }
}

/// Spawns the server-initiated consume flow for one (producer, subscriber)
/// pair. Runs outside the room lock so the ack wait never blocks the room.
pub(crate) fn schedule_push_consumer(
    room_lock: Arc<TokioRwLock<Room>>,
    producer_owner: String,
    subscriber: String,
    tag: MediaTag,
) {
    tokio::spawn(async move {
        match push_consumer(&room_lock, &producer_owner, &subscriber, tag).await {
            Ok(()) => {}
            Err(MediaError::RequestTimeout) => {
                warn!(
                    "push {} consumer of {} to {} timed out, consumer closed",
                    tag, producer_owner, subscriber
                );
            }
            Err(e) => {
                debug!(
                    "push {} consumer of {} to {} skipped: {}",
                    tag, producer_owner, subscriber, e
                );
            }
        }
    });
}

/// Push consume flow: create the consumer paused, request `newConsumer`
/// from the subscriber with an ack window of 20 seconds and up to three
/// attempts, and resume on ack. On the final timeout the consumer is
/// closed and `RequestTimeout` surfaces. Participant and producer
/// liveness are re-checked after every lock re-acquisition.
async fn push_consumer(
    room_lock: &Arc<TokioRwLock<Room>>,
    peer: &str,
    subscriber: &str,
    tag: MediaTag,
) -> MediaResult<()> {
    let (descriptor, consumer_kind, request_id, mut ack_rx, sender) = {
        let mut room = room_lock.write().await;
        if room.reconfiguring {
            return Err(MediaError::RoomReconfiguring);
        }

        let producer = {
            let owner = room
                .participants
                .get(peer)
                .ok_or_else(|| MediaError::ParticipantNotFound(peer.to_string()))?;
            owner
                .producer(tag)
                .cloned()
                .ok_or_else(|| MediaError::ProducerNotFound(format!("{tag} of {peer}")))?
        };
        let router = room.router.clone();
        let events = room.events.clone();

        let target = room
            .participants
            .get_mut(subscriber)
            .ok_or_else(|| MediaError::ParticipantNotFound(subscriber.to_string()))?;
        if !target.joined {
            return Err(MediaError::ParticipantNotFound(format!("{subscriber} not joined")));
        }
        if target.consumers(tag).contains_key(peer) {
            return Ok(());
        }
        let rtp_capabilities = target
            .rtp_capabilities
            .clone()
            .ok_or_else(|| MediaError::CannotConsume("missing rtp capabilities".to_string()))?;
        let transport = target
            .transport(TransportKind::Consumer)
            .cloned()
            .ok_or_else(|| {
                MediaError::TransportNotFound(format!("consumer transport of {subscriber}"))
            })?;

        if !router.can_consume(&producer.id(), &rtp_capabilities) {
            return Err(MediaError::CannotConsume(format!(
                "incompatible rtp capabilities for {tag} of {peer}"
            )));
        }

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        options.paused = true;
        if producer.kind() == MediaKind::Video {
            options.preferred_layers = Some(ConsumerLayers {
                spatial_layer: 2,
                temporal_layer: Some(2),
            });
        }

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| anyhow!("push consume {tag} of {peer}: {e}"))?;

        wire_consumer(&consumer, subscriber, peer, tag, target.sender.clone(), events);

        let descriptor = ConsumerDescriptor::from(&consumer);
        let consumer_kind = consumer.kind();
        let (request_id, ack_rx) = target.acks.register();
        let sender = target.sender.clone();
        target.consumers_mut(tag).insert(peer.to_string(), consumer);

        (descriptor, consumer_kind, request_id, ack_rx, sender)
    };

    let request = ServerEvent::NewConsumer {
        request_id,
        user_id: peer.to_string(),
        media_tag: tag,
        consumer: descriptor,
    };

    let mut acked = false;
    let mut cancelled = false;
    for attempt in 1..=ACK_ATTEMPTS {
        protocol::push(&sender, &request);
        match tokio::time::timeout(ACK_TIMEOUT, &mut ack_rx).await {
            Ok(Ok(())) => {
                acked = true;
                break;
            }
            Ok(Err(_)) => {
                // subscriber disconnected; its teardown owns the cleanup
                cancelled = true;
                break;
            }
            Err(_) => {
                debug!(
                    "newConsumer ack attempt {}/{} for {} timed out",
                    attempt, ACK_ATTEMPTS, subscriber
                );
            }
        }
    }

    let mut room = room_lock.write().await;
    let Some(target) = room.participants.get_mut(subscriber) else {
        return Ok(());
    };

    if acked {
        let Some(consumer) = target.consumers(tag).get(peer) else {
            return Ok(());
        };
        consumer
            .resume()
            .await
            .map_err(|e| anyhow!("resume pushed consumer: {e}"))?;
        if consumer_kind == MediaKind::Audio {
            consumer
                .set_priority(255)
                .await
                .map_err(|e| anyhow!("set audio consumer priority: {e}"))?;
        }
        debug!("pushed {} consumer of {} to {} acknowledged", tag, peer, subscriber);
        Ok(())
    } else {
        target.acks.unregister(request_id);
        target.consumers_mut(tag).remove(peer);
        if cancelled {
            Ok(())
        } else {
            Err(MediaError::RequestTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::worker_pool::WorkerPool;
    use crate::metrics::ServerMetrics;
    use crate::room::RoomRegistry;
    use crate::signaling::connection::AckRegistry;
    use crate::signaling::protocol::{HandshakeQuery, ProducerCapabilities};

    async fn registry_with_room(session: &str) -> RoomRegistry {
        let mut config = MediaConfig::default();
        config.worker.pool_size = 1;
        let pool = Arc::new(WorkerPool::start(&config.worker).await.unwrap());
        let registry = RoomRegistry::new(pool, config, ServerMetrics::new());
        registry.init_session(session).await.unwrap();
        registry
    }

    fn query(session: &str, user: &str) -> HandshakeQuery {
        HandshakeQuery {
            user_id: user.to_string(),
            session_id: session.to_string(),
            device: "desktop".to_string(),
            kind: TransportKind::Producer,
        }
    }

    fn capabilities(global_audio: bool) -> ProducerCapabilities {
        ProducerCapabilities {
            producer_audio_enabled: true,
            producer_video_enabled: true,
            global_audio_enabled: global_audio,
            global_video_enabled: true,
        }
    }

    async fn admit_and_join(
        registry: &RoomRegistry,
        session: &str,
        user: &str,
        global_audio: bool,
    ) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(64);
        let q = query(session, user);
        registry
            .add_client(&q, TransportKind::Producer, tx, AckRegistry::new())
            .await
            .unwrap();
        registry
            .join_room(&q, RtpCapabilities::default(), capabilities(global_audio))
            .await
            .unwrap();
        rx
    }

    fn event_name(frame: &Arc<String>) -> String {
        serde_json::from_str::<Value>(frame)
            .ok()
            .and_then(|v| v.get("event").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    }

    async fn drain_events(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            names.push(event_name(&frame));
        }
        names
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let registry = registry_with_room("r1").await;
        let _rx = admit_and_join(&registry, "r1", "alice", true).await;

        let result = registry
            .handle_media("r1", "alice", json!({ "action": "selfDestruct" }))
            .await;
        assert!(matches!(result, Err(MediaError::UnknownAction(_))));
    }

    #[tokio::test]
    async fn router_capabilities_cover_configured_codecs() {
        let registry = registry_with_room("r1").await;
        let _rx = admit_and_join(&registry, "r1", "alice", true).await;

        let result = registry
            .handle_media("r1", "alice", json!({ "action": "getRouterRtpCapabilities" }))
            .await
            .unwrap();
        let codecs = result.get("codecs").and_then(Value::as_array).unwrap();
        assert!(!codecs.is_empty());
    }

    #[tokio::test]
    async fn transport_commands_check_participant_and_transport() {
        let registry = registry_with_room("r1").await;
        let _rx = admit_and_join(&registry, "r1", "alice", true).await;

        let result = registry
            .handle_media(
                "r1",
                "ghost",
                json!({ "action": "createWebRtcTransport", "data": { "kind": "producer" } }),
            )
            .await;
        assert!(matches!(result, Err(MediaError::ParticipantNotFound(_))));

        let result = registry
            .handle_media(
                "r1",
                "alice",
                json!({ "action": "restartIce", "data": { "kind": "consumer" } }),
            )
            .await;
        assert!(matches!(result, Err(MediaError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn created_transport_returns_ice_and_dtls_parameters() {
        let registry = registry_with_room("r1").await;
        let _rx = admit_and_join(&registry, "r1", "alice", true).await;

        let result = registry
            .handle_media(
                "r1",
                "alice",
                json!({ "action": "createWebRtcTransport", "data": { "kind": "consumer" } }),
            )
            .await
            .unwrap();
        assert!(result.get("id").is_some());
        assert!(result.get("iceParameters").is_some());
        assert!(result.get("iceCandidates").is_some());
        assert!(result.get("dtlsParameters").is_some());
    }

    #[tokio::test]
    async fn consume_without_producer_cannot_consume() {
        let registry = registry_with_room("r1").await;
        let _rx_a = admit_and_join(&registry, "r1", "alice", true).await;
        let _rx_b = admit_and_join(&registry, "r1", "bob", true).await;

        let result = registry
            .handle_media(
                "r1",
                "alice",
                json!({ "action": "consume", "data": { "userId": "bob", "kind": "audio" } }),
            )
            .await;
        assert!(matches!(result, Err(MediaError::CannotConsume(_))));
    }

    #[tokio::test]
    async fn global_mute_suppresses_per_user_pause() {
        let registry = registry_with_room("r1").await;
        let mut rx = admit_and_join(&registry, "r1", "alice", false).await;
        drain_events(&mut rx).await;

        // alice joined with global audio off; a non-global pause is a no-op
        // and must not broadcast mediaProducerPause
        let result = registry
            .handle_media(
                "r1",
                "alice",
                json!({
                    "action": "producerPause",
                    "data": { "userId": "alice", "kind": "audio", "isGlobal": false },
                }),
            )
            .await
            .unwrap();
        assert_eq!(result.get("paused").and_then(Value::as_bool), Some(false));

        let events = drain_events(&mut rx).await;
        assert!(!events.iter().any(|e| e == "mediaProducerPause"));
    }

    #[tokio::test]
    async fn resume_of_missing_producer_requests_republication() {
        let registry = registry_with_room("r1").await;
        let mut rx = admit_and_join(&registry, "r1", "alice", true).await;
        drain_events(&mut rx).await;

        let result = registry
            .handle_media(
                "r1",
                "alice",
                json!({
                    "action": "producerResume",
                    "data": { "userId": "alice", "kind": "audio" },
                }),
            )
            .await
            .unwrap();
        assert_eq!(result.get("reproduce").and_then(Value::as_bool), Some(true));

        let events = drain_events(&mut rx).await;
        assert!(events.iter().any(|e| e == "mediaReproduce"));
    }

    #[tokio::test]
    async fn resume_never_asks_viewer_only_participants_to_publish() {
        let registry = registry_with_room("r1").await;
        let (tx, mut rx) = mpsc::channel(64);
        let mut q = query("r1", "viewer");
        q.kind = TransportKind::Consumer;
        registry
            .add_client(&q, TransportKind::Consumer, tx, AckRegistry::new())
            .await
            .unwrap();
        registry
            .join_room(&q, RtpCapabilities::default(), capabilities(true))
            .await
            .unwrap();
        drain_events(&mut rx).await;

        let result = registry
            .handle_media(
                "r1",
                "viewer",
                json!({
                    "action": "producerResume",
                    "data": { "userId": "viewer", "kind": "audio" },
                }),
            )
            .await;
        assert!(matches!(result, Err(MediaError::ProducerNotFound(_))));

        let events = drain_events(&mut rx).await;
        assert!(!events.iter().any(|e| e == "mediaReproduce"));
    }

    #[tokio::test]
    async fn reconfigure_rebinds_router_and_notifies_room() {
        let registry = registry_with_room("r1").await;
        let mut rx = admit_and_join(&registry, "r1", "alice", true).await;
        drain_events(&mut rx).await;

        registry.reconfigure_media("r1").await.unwrap();

        let events = drain_events(&mut rx).await;
        assert!(events.iter().any(|e| e == "mediaReconfigure"));

        // the room still answers commands after the swap
        let result = registry
            .handle_media("r1", "alice", json!({ "action": "getRouterRtpCapabilities" }))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn join_announces_to_the_whole_room() {
        let registry = registry_with_room("r1").await;
        let mut rx_a = admit_and_join(&registry, "r1", "alice", true).await;
        drain_events(&mut rx_a).await;

        let _rx_b = admit_and_join(&registry, "r1", "bob", true).await;

        let events = drain_events(&mut rx_a).await;
        assert!(events.iter().any(|e| e == "mediaClientConnected"));
    }

    #[tokio::test]
    async fn disconnect_notifies_remaining_peers_only() {
        let registry = registry_with_room("r1").await;
        let mut rx_a = admit_and_join(&registry, "r1", "alice", true).await;
        let mut rx_b = admit_and_join(&registry, "r1", "bob", true).await;
        drain_events(&mut rx_a).await;
        drain_events(&mut rx_b).await;

        registry.remove_client("r1", "bob").await;

        let events_a = drain_events(&mut rx_a).await;
        assert!(events_a.iter().any(|e| e == "mediaClientDisconnect"));
        let events_b = drain_events(&mut rx_b).await;
        assert!(!events_b.iter().any(|e| e == "mediaClientDisconnect"));
    }
}
