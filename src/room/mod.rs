#![forbid(unsafe_code)]

// Room module - session state, worker placement, fan-out and lifecycle
//
// Locking follows the two-level pattern: the registry map sits behind a
// std::sync::RwLock held only for brief lookups (never across await points),
// while each room is serialized by its own tokio::sync::RwLock so that two
// mutating commands inside one room never interleave.

pub mod commands;
pub mod participant;

use crate::media::config::{MediaConfig, WebRtcTransportConfig};
use crate::media::types::{
    MediaError, MediaResult, MediaTag, ProducerAppData, RoomStats, TransportKind,
};
use crate::media::worker_pool::WorkerPool;
use crate::metrics::ServerMetrics;
use crate::signaling::connection::AckRegistry;
use crate::signaling::protocol::{self, HandshakeQuery, PeerInfo, ProducerCapabilities, ServerEvent};
use anyhow::anyhow;
use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::prelude::*;
use participant::Participant;
use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Outcome of `initSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInit {
    Created,
    AlreadyExists,
}

/// Reply payload of `joinRoom`.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub user_id: String,
    pub peers_info: Vec<PeerInfo>,
}

/// Internal signals raised by synchronous mediasoup callbacks and applied
/// to the room state by its event pump.
#[derive(Debug)]
pub enum RoomEvent {
    /// A consumer closed underneath us (producer or transport went away)
    ConsumerGone {
        owner: String,
        peer: String,
        tag: MediaTag,
    },
    /// A transport hit DTLS `closed`/`failed` and must be dropped server-side
    TransportClosed {
        user_id: String,
        kind: TransportKind,
    },
}

/// The set of joined sockets for one session. Shared between the room and
/// the observer/producer callbacks, which run on the mediasoup event thread
/// and therefore fan out through a brief std lock and `try_send` only.
#[derive(Clone, Default)]
pub struct BroadcastGroup {
    members: Arc<StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.insert(user_id.to_string(), sender);
    }

    pub fn remove(&self, user_id: &str) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.remove(user_id);
    }

    /// Fan-out to every member except the sender.
    pub fn broadcast(&self, sender_id: &str, event: &ServerEvent) {
        let Some(json) = protocol::encode(event) else {
            return;
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        for (id, sender) in members.iter() {
            if id != sender_id {
                let _ = sender.try_send(json.clone());
            }
        }
    }

    /// Fan-out to every member, sender included.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let Some(json) = protocol::encode(event) else {
            return;
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        for sender in members.values() {
            let _ = sender.try_send(json.clone());
        }
    }

    /// Notification to exactly one member. Returns false if the member is
    /// not in the group.
    pub fn notify(&self, user_id: &str, event: &ServerEvent) -> bool {
        let Some(json) = protocol::encode(event) else {
            return false;
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        match members.get(user_id) {
            Some(sender) => {
                let _ = sender.try_send(json);
                true
            }
            None => false,
        }
    }
}

/// One session: a router and audio-level observer pinned to one worker,
/// plus the participant records keyed by user id.
pub struct Room {
    pub id: String,
    pub worker_index: usize,
    pub(crate) router: Router,
    pub(crate) audio_observer: AudioLevelObserver,
    pub(crate) participants: HashMap<String, Participant>,
    pub(crate) group: BroadcastGroup,
    pub(crate) events: mpsc::UnboundedSender<RoomEvent>,
    pub(crate) reconfiguring: bool,
    pub(crate) config: Arc<MediaConfig>,
}

/// Pure bitrate governance: spread the outgoing budget across producers,
/// clamp to the configured minimum, and keep small rooms at the maximum.
pub fn compute_incoming_bitrate(producer_count: usize, config: &WebRtcTransportConfig) -> u32 {
    let max = config.maximum_available_outgoing_bitrate;
    if producer_count < 3 {
        return max;
    }
    let divisor = ((producer_count - 1) as f64) * config.factor_incoming_bitrate;
    let raw = (f64::from(max) / divisor).floor() as u32;
    raw.max(config.minimum_available_outgoing_bitrate)
}

impl Room {
    /// Total live producers across all participants
    pub fn producer_count(&self) -> usize {
        self.participants.values().map(Participant::producer_count).sum()
    }

    /// Re-applies `max_incoming_bitrate` to every live transport. Runs on
    /// transport creation and whenever producer topology changes.
    pub(crate) async fn update_incoming_bitrate(&self) {
        let producer_count = self.producer_count();
        let bitrate = compute_incoming_bitrate(producer_count, &self.config.webrtc_transport);

        for participant in self.participants.values() {
            let transports = [
                participant.producer_transport.as_ref(),
                participant.consumer_transport.as_ref(),
            ];
            for transport in transports.into_iter().flatten() {
                if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                    warn!(
                        "failed to set max incoming bitrate on transport {}: {}",
                        transport.id(),
                        e
                    );
                }
            }
        }

        debug!(
            "room {}: max incoming bitrate {} for {} producers",
            self.id, bitrate, producer_count
        );
    }

    /// Applies a signal raised by a mediasoup callback.
    pub(crate) async fn apply_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::ConsumerGone { owner, peer, tag } => {
                if let Some(participant) = self.participants.get_mut(&owner) {
                    if participant.consumers_mut(tag).remove(&peer).is_some() {
                        debug!("room {}: dropped {} consumer of {} on {}", self.id, tag, peer, owner);
                    }
                }
            }
            RoomEvent::TransportClosed { user_id, kind } => {
                let Some(participant) = self.participants.get_mut(&user_id) else {
                    return;
                };
                if participant.take_transport(kind).is_none() {
                    return;
                }
                warn!("room {}: {} transport of {} closed server-side", self.id, kind, user_id);
                match kind {
                    TransportKind::Producer => {
                        participant.take_producer(MediaTag::Audio);
                        participant.take_producer(MediaTag::Video);
                        participant.take_producer(MediaTag::Screen);
                    }
                    TransportKind::Consumer => {
                        participant.consumers_mut(MediaTag::Audio).clear();
                        participant.consumers_mut(MediaTag::Video).clear();
                        participant.consumers_mut(MediaTag::Screen).clear();
                    }
                }
                self.update_incoming_bitrate().await;
            }
        }
    }

    /// Read-only snapshot for the stats surface.
    pub fn stats(&self) -> RoomStats {
        let clients = self.participants.values().map(Participant::client_stats).collect();
        let mut group_by_device: HashMap<String, usize> = HashMap::new();
        for participant in self.participants.values() {
            *group_by_device.entry(participant.device.clone()).or_insert(0) += 1;
        }
        RoomStats {
            id: self.id.clone(),
            worker: self.worker_index,
            clients,
            group_by_device,
        }
    }

    /// Joined members, for `mediaRoomClients` and the join reply.
    pub fn peers_info(&self) -> Vec<PeerInfo> {
        self.participants
            .values()
            .filter(|p| p.joined)
            .map(Participant::peer_info)
            .collect()
    }

    /// Tears the room down: notifies every still-present member, removes
    /// them from the group, closes their media, clears the map. The
    /// observer and router close when the room is dropped right after.
    /// A second call finds no participants and does nothing.
    pub(crate) fn close(&mut self) {
        for (user_id, participant) in self.participants.iter_mut() {
            protocol::push(
                &participant.sender,
                &ServerEvent::MediaDisconnectMember { user_id: user_id.clone() },
            );
            self.group.remove(user_id);
            participant.close_media();
        }
        self.participants.clear();
        info!("room {} closed", self.id);
    }
}

/// Process-wide registry of live rooms plus the worker pool they are
/// scheduled onto. Supplied to the gateway as an explicit dependency.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    pool: Arc<WorkerPool>,
    config: Arc<MediaConfig>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(pool: Arc<WorkerPool>, config: MediaConfig, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            pool,
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn room_exists(&self, session_id: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.contains_key(session_id)
    }

    /// Room lock by session id (brief outer read lock, no await)
    pub(crate) fn room(&self, session_id: &str) -> MediaResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(session_id)
            .cloned()
            .ok_or_else(|| MediaError::RoomNotFound(session_id.to_string()))
    }

    fn rooms_snapshot(&self) -> Vec<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().cloned().collect()
    }

    /// Recomputes pool counters from a scan of live rooms, so placement
    /// decisions never rely on drifting bump-style bookkeeping.
    async fn refresh_pool(&self) {
        let mut load = Vec::new();
        for room_lock in self.rooms_snapshot() {
            let room = room_lock.read().await;
            load.push((room.worker_index, room.participants.len()));
        }
        self.pool.refresh_counters(&load);
    }

    /// Builds a router and its audio-level observer on the given worker and
    /// wires the dominant-speaker events into the broadcast group.
    async fn build_media(
        &self,
        worker: &Worker,
        group: &BroadcastGroup,
    ) -> MediaResult<(Router, AudioLevelObserver)> {
        let router = worker
            .create_router(self.config.router.to_router_options())
            .await
            .map_err(|e| MediaError::RoomInit(format!("create router: {e}")))?;

        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = NonZeroU16::new(1)
            .ok_or_else(|| MediaError::RoomInit("invalid observer max entries".to_string()))?;
        options.threshold = -80;
        options.interval = 800;

        let observer = router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| MediaError::RoomInit(format!("create audio observer: {e}")))?;

        // With max_entries = 1 only the loudest producer is reported, so the
        // first volume entry names the dominant speaker.
        observer
            .on_volumes({
                let group = group.clone();
                move |volumes| {
                    if let Some(entry) = volumes.first() {
                        let user_id = entry
                            .producer
                            .app_data()
                            .downcast_ref::<ProducerAppData>()
                            .map(|data| data.user_id.clone());
                        group.broadcast_all(&ServerEvent::MediaActiveSpeaker {
                            user_id,
                            volume: Some(entry.volume),
                        });
                    }
                }
            })
            .detach();

        observer
            .on_silence({
                let group = group.clone();
                move || {
                    group.broadcast_all(&ServerEvent::MediaActiveSpeaker {
                        user_id: None,
                        volume: None,
                    });
                }
            })
            .detach();

        Ok((router, observer))
    }

    /// Ensures a room exists for the session. Placement: refresh counters,
    /// pick the least-loaded worker, build router and observer, register.
    /// Any failure leaves no partial room behind; a concurrent creation
    /// race is resolved under the registry write lock, the loser dropping
    /// its freshly built router.
    pub async fn init_session(&self, session_id: &str) -> MediaResult<SessionInit> {
        if self.room_exists(session_id) {
            return Ok(SessionInit::AlreadyExists);
        }

        self.refresh_pool().await;
        let worker_index = self.pool.pick_least_loaded();
        let worker = self.pool.worker(worker_index)?;

        let group = BroadcastGroup::new();
        let (router, observer) = self.build_media(&worker, &group).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let room = Room {
            id: session_id.to_string(),
            worker_index,
            router,
            audio_observer: observer,
            participants: HashMap::new(),
            group,
            events: events_tx,
            reconfiguring: false,
            config: self.config.clone(),
        };

        let room_lock = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(session_id) {
                // lost the race; the router and observer close on drop
                return Ok(SessionInit::AlreadyExists);
            }
            let room_lock = Arc::new(TokioRwLock::new(room));
            rooms.insert(session_id.to_string(), room_lock.clone());
            room_lock
        };

        spawn_event_pump(Arc::downgrade(&room_lock), events_rx);
        self.metrics.inc_rooms_created();
        info!("room {} created on worker {}", session_id, worker_index);
        Ok(SessionInit::Created)
    }

    /// Pre-join admission. The participant is recorded but receives no
    /// fan-out until `joinRoom`.
    pub async fn add_client(
        &self,
        query: &HandshakeQuery,
        kind: TransportKind,
        sender: mpsc::Sender<Arc<String>>,
        acks: AckRegistry,
    ) -> MediaResult<()> {
        let room_lock = self.room(&query.session_id)?;
        let mut room = room_lock.write().await;

        if room.participants.contains_key(&query.user_id) {
            return Err(MediaError::DuplicateParticipant(query.user_id.clone()));
        }

        room.participants.insert(
            query.user_id.clone(),
            Participant::new(query.user_id.clone(), query.device.clone(), kind, sender, acks),
        );

        info!("room {}: admitted {} ({})", query.session_id, query.user_id, kind);
        Ok(())
    }

    /// Marks a pre-admitted participant as joined: records capabilities and
    /// enable flags, adds the socket to the broadcast group, announces the
    /// join, and schedules push consumers for every producing peer.
    pub async fn join_room(
        &self,
        query: &HandshakeQuery,
        rtp_capabilities: RtpCapabilities,
        capabilities: ProducerCapabilities,
    ) -> MediaResult<JoinOutcome> {
        let room_lock = self.room(&query.session_id)?;
        let producing: Vec<(String, MediaTag)>;
        let peers_info;

        {
            let mut room = room_lock.write().await;

            {
                let participant = room
                    .participants
                    .get(&query.user_id)
                    .ok_or_else(|| MediaError::ParticipantNotFound(query.user_id.clone()))?;
                if participant.joined {
                    return Err(MediaError::AlreadyJoined(query.user_id.clone()));
                }
            }

            peers_info = room.peers_info();

            producing = room
                .participants
                .iter()
                .filter(|(id, _)| id.as_str() != query.user_id)
                .flat_map(|(id, peer)| {
                    [MediaTag::Audio, MediaTag::Video, MediaTag::Screen]
                        .into_iter()
                        .filter(|tag| peer.producer(*tag).is_some())
                        .map(|tag| (id.clone(), tag))
                        .collect::<Vec<_>>()
                })
                .collect();

            let participant = room
                .participants
                .get_mut(&query.user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(query.user_id.clone()))?;
            participant.rtp_capabilities = Some(rtp_capabilities);
            participant.produce_audio_enabled = capabilities.producer_audio_enabled;
            participant.produce_video_enabled = capabilities.producer_video_enabled;
            participant.global_audio_enabled = capabilities.global_audio_enabled;
            participant.global_video_enabled = capabilities.global_video_enabled;
            participant.joined = true;
            let sender = participant.sender.clone();

            room.group.insert(&query.user_id, sender);
            room.group.broadcast_all(&ServerEvent::MediaClientConnected {
                user_id: query.user_id.clone(),
            });

            info!("room {}: {} joined", query.session_id, query.user_id);
        }

        for (peer_id, tag) in producing {
            commands::schedule_push_consumer(
                room_lock.clone(),
                peer_id,
                query.user_id.clone(),
                tag,
            );
        }

        self.metrics.inc_joins();
        Ok(JoinOutcome {
            user_id: query.user_id.clone(),
            peers_info,
        })
    }

    /// Removes a participant: announces the disconnect to the rest of the
    /// room, leaves the group, tears down producers, consumers and
    /// transports in that order, and unregisters the room once empty.
    /// Idempotent for unknown sessions and users.
    pub async fn remove_client(&self, session_id: &str, user_id: &str) {
        let Ok(room_lock) = self.room(session_id) else {
            return;
        };

        let room_empty = {
            let mut room = room_lock.write().await;
            if let Some(mut participant) = room.participants.remove(user_id) {
                room.group.broadcast(user_id, &ServerEvent::MediaClientDisconnect {
                    user_id: user_id.to_string(),
                });
                room.group.remove(user_id);
                participant.close_media();
                info!("room {}: {} left", session_id, user_id);
                self.metrics.inc_leaves();
            }
            let empty = room.participants.is_empty();
            if !empty {
                room.update_incoming_bitrate().await;
            }
            empty
        };

        if room_empty {
            // re-check emptiness under the registry write lock: an admission
            // may have raced in between the two lock scopes
            let removed = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                let still_empty = rooms.get(session_id).is_some_and(|lock| {
                    lock.try_write().map_or(false, |room| room.participants.is_empty())
                });
                if still_empty {
                    rooms.remove(session_id)
                } else {
                    None
                }
            };
            if let Some(room_lock) = removed {
                room_lock.write().await.close();
                // router and observer close when the last Arc drops
            }
        }
    }

    /// Moves a room onto a freshly selected worker. Three phases: tear
    /// down participant media under the lock, build the replacement router
    /// and observer without the lock, then install and announce. Commands
    /// arriving between the phases fail with `RoomReconfiguring`.
    pub async fn reconfigure_media(&self, session_id: &str) -> MediaResult<()> {
        let room_lock = self.room(session_id)?;

        let group = {
            let mut room = room_lock.write().await;
            if room.reconfiguring {
                return Err(MediaError::RoomReconfiguring);
            }
            room.reconfiguring = true;
            for participant in room.participants.values_mut() {
                participant.close_media();
            }
            room.group.clone()
        };

        self.refresh_pool().await;
        let worker_index = self.pool.pick_least_loaded();
        let built = match self.pool.worker(worker_index) {
            Ok(worker) => self.build_media(&worker, &group).await,
            Err(e) => Err(e),
        };

        let mut room = room_lock.write().await;
        room.reconfiguring = false;
        let (router, observer) = built.map_err(|e| {
            warn!("room {}: reconfigure failed: {}", session_id, e);
            e
        })?;

        // replace observer before router so teardown order matches creation
        room.audio_observer = observer;
        room.router = router;
        room.worker_index = worker_index;
        room.group.broadcast_all(&ServerEvent::MediaReconfigure);

        info!("room {} reconfigured onto worker {}", session_id, worker_index);
        Ok(())
    }

    /// Pure relay of a device toggle to the rest of the room.
    pub async fn toggle_device(&self, session_id: &str, sender_id: &str, action: String, kind: String) {
        if let Ok(room_lock) = self.room(session_id) {
            let room = room_lock.read().await;
            room.group.broadcast(sender_id, &ServerEvent::ToggleDevice {
                sender: sender_id.to_string(),
                action,
                kind,
            });
        }
    }

    /// Joined members of one room
    pub async fn room_clients(&self, session_id: &str) -> Vec<PeerInfo> {
        match self.room(session_id) {
            Ok(room_lock) => room_lock.read().await.peers_info(),
            Err(_) => Vec::new(),
        }
    }

    /// Stats snapshot of one room
    pub async fn room_stats(&self, session_id: &str) -> Option<RoomStats> {
        let room_lock = self.room(session_id).ok()?;
        let room = room_lock.read().await;
        Some(room.stats())
    }

    /// Stats snapshots of all rooms
    pub async fn all_stats(&self) -> Vec<RoomStats> {
        let mut stats = Vec::new();
        for room_lock in self.rooms_snapshot() {
            let room = room_lock.read().await;
            stats.push(room.stats());
        }
        stats
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn participant_count(&self) -> usize {
        let mut total = 0;
        for room_lock in self.rooms_snapshot() {
            total += room_lock.read().await.participants.len();
        }
        total
    }

    /// Graceful shutdown: closes every room and drops the map.
    pub async fn shutdown(&self) {
        let all: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        for (session_id, room_lock) in all {
            room_lock.write().await.close();
            debug!("room {} shut down", session_id);
        }
        info!("all rooms shut down");
    }
}

/// Applies callback-raised signals to the room until it is dropped.
fn spawn_event_pump(room: Weak<TokioRwLock<Room>>, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(room_lock) = room.upgrade() else {
                break;
            };
            let mut room = room_lock.write().await;
            room.apply_event(event).await;
        }
    });
}

// json helper shared by the command handlers
pub(crate) fn json<T: serde::Serialize>(value: &T) -> MediaResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| MediaError::Other(anyhow!("serialize reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MediaConfig {
        let mut config = MediaConfig::default();
        config.worker.pool_size = 1;
        config
    }

    async fn test_registry() -> RoomRegistry {
        let config = test_config();
        let pool = Arc::new(WorkerPool::start(&config.worker).await.unwrap());
        RoomRegistry::new(pool, config, ServerMetrics::new())
    }

    fn test_query(session: &str, user: &str) -> HandshakeQuery {
        HandshakeQuery {
            user_id: user.to_string(),
            session_id: session.to_string(),
            device: "desktop".to_string(),
            kind: TransportKind::Producer,
        }
    }

    fn test_sender() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn init_session_is_idempotent_per_session() {
        let registry = test_registry().await;
        assert_eq!(registry.init_session("r1").await.unwrap(), SessionInit::Created);
        assert_eq!(registry.init_session("r1").await.unwrap(), SessionInit::AlreadyExists);
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_admission_fails_without_mutation() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();

        let query = test_query("r1", "alice");
        let (tx, _rx) = test_sender();
        registry
            .add_client(&query, TransportKind::Producer, tx.clone(), AckRegistry::new())
            .await
            .unwrap();

        let result = registry
            .add_client(&query, TransportKind::Producer, tx, AckRegistry::new())
            .await;
        assert!(matches!(result, Err(MediaError::DuplicateParticipant(_))));
        assert_eq!(registry.participant_count().await, 1);
    }

    #[tokio::test]
    async fn join_before_admission_fails() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();

        let query = test_query("r1", "ghost");
        let capabilities = ProducerCapabilities {
            producer_audio_enabled: true,
            producer_video_enabled: true,
            global_audio_enabled: true,
            global_video_enabled: true,
        };
        let result = registry
            .join_room(&query, RtpCapabilities::default(), capabilities)
            .await;
        assert!(matches!(result, Err(MediaError::ParticipantNotFound(_))));
    }

    #[tokio::test]
    async fn join_twice_fails_with_already_joined() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();

        let query = test_query("r1", "alice");
        let (tx, _rx) = test_sender();
        registry
            .add_client(&query, TransportKind::Producer, tx, AckRegistry::new())
            .await
            .unwrap();

        let capabilities = ProducerCapabilities {
            producer_audio_enabled: true,
            producer_video_enabled: false,
            global_audio_enabled: true,
            global_video_enabled: true,
        };
        registry
            .join_room(&query, RtpCapabilities::default(), capabilities)
            .await
            .unwrap();
        let result = registry
            .join_room(&query, RtpCapabilities::default(), capabilities)
            .await;
        assert!(matches!(result, Err(MediaError::AlreadyJoined(_))));
    }

    #[tokio::test]
    async fn empty_room_is_unregistered_after_last_leave() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();

        let query = test_query("r1", "alice");
        let (tx, _rx) = test_sender();
        registry
            .add_client(&query, TransportKind::Producer, tx, AckRegistry::new())
            .await
            .unwrap();

        registry.remove_client("r1", "alice").await;
        assert_eq!(registry.room_count(), 0);

        // close then init produces a fresh room
        assert_eq!(registry.init_session("r1").await.unwrap(), SessionInit::Created);
    }

    #[tokio::test]
    async fn remove_client_is_idempotent() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();
        registry.remove_client("r1", "nobody").await;
        registry.remove_client("missing", "nobody").await;
    }

    #[test]
    fn bitrate_governance_keeps_small_rooms_at_maximum() {
        let config = WebRtcTransportConfig::default();
        assert_eq!(
            compute_incoming_bitrate(0, &config),
            config.maximum_available_outgoing_bitrate
        );
        assert_eq!(
            compute_incoming_bitrate(2, &config),
            config.maximum_available_outgoing_bitrate
        );
    }

    #[test]
    fn bitrate_governance_divides_and_clamps() {
        let mut config = WebRtcTransportConfig::default();
        config.maximum_available_outgoing_bitrate = 3_000_000;
        config.minimum_available_outgoing_bitrate = 100_000;
        config.factor_incoming_bitrate = 0.75;

        // 3 producers: 3_000_000 / (2 * 0.75) = 2_000_000
        assert_eq!(compute_incoming_bitrate(3, &config), 2_000_000);

        // large rooms clamp to the minimum
        assert_eq!(compute_incoming_bitrate(1000, &config), 100_000);
    }

    #[test]
    fn bitrate_governance_never_drops_below_minimum() {
        let config = WebRtcTransportConfig::default();
        for producers in 0..64 {
            assert!(
                compute_incoming_bitrate(producers, &config)
                    >= config.minimum_available_outgoing_bitrate
            );
        }
    }

    #[tokio::test]
    async fn worker_pool_counters_follow_room_scan() {
        let registry = test_registry().await;
        registry.init_session("r1").await.unwrap();

        let query = test_query("r1", "alice");
        let (tx, _rx) = test_sender();
        registry
            .add_client(&query, TransportKind::Producer, tx, AckRegistry::new())
            .await
            .unwrap();

        registry.refresh_pool().await;
        let stats = registry.pool().stats();
        let slot = stats.values().find(|s| s.worker_index == 0).unwrap();
        assert_eq!(slot.room_count, 1);
        assert_eq!(slot.participant_count, 1);
    }
}
