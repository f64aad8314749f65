//! SFU Manager - signaling core
//!
//! This module provides:
//! - Per-connection sessions and the join → transport → connect →
//!   produce/consume handshake
//! - Fan-out of producer lifecycle notifications within a room
//! - Cascading teardown on explicit close, disconnect and engine events
//!
//! Lock order is session entry, then registries, then the room directory.
//! No map guard is held across an engine call.

use crate::config::SfuConfig;
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{SfuError, SfuResult};
use crate::media::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use crate::peer::{Notification, NotificationSender, ParticipantSession, PeerDetails, SessionInfo};
use crate::registry::{
    ConsumerEntry, ConsumerRegistry, ProducerEntry, ProducerRegistry, TransportDirection,
    TransportEntry, TransportRegistry,
};
use crate::room::{Room, RoomDirectory, RoomLimits};
use crate::types::{ConnectionId, ConsumerId, ProducerId, RoomName, TransportId};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Connection parameters for a newly created transport
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceOutcome {
    pub producer_id: ProducerId,
    /// A producer owned by another connection in the room existed at call time
    pub other_producers_exist: bool,
}

/// Parameters a client needs to start receiving a consumer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub server_consumer_id: ConsumerId,
}

/// Global SFU manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub rooms: usize,
    pub sessions: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

pub struct SfuManager {
    config: SfuConfig,
    rooms: RoomDirectory,
    sessions: DashMap<ConnectionId, ParticipantSession>,
    transports: TransportRegistry,
    producers: ProducerRegistry,
    consumers: ConsumerRegistry,
}

impl SfuManager {
    /// Create a new SFU manager and start listening to engine events
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let events = engine.subscribe_events();
        let limits = RoomLimits {
            max_rooms: config.max_rooms,
            max_peers_per_room: config.max_peers_per_room,
            close_empty_rooms: config.close_empty_rooms,
            router_timeout: config.handshake_timeout,
        };

        let manager = Arc::new(Self {
            rooms: RoomDirectory::new(engine, config.media_codecs.clone(), limits),
            config,
            sessions: DashMap::new(),
            transports: TransportRegistry::new(),
            producers: ProducerRegistry::new(),
            consumers: ConsumerRegistry::new(),
        });

        info!(
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            codecs = manager.config.media_codecs.len(),
            "SFU Manager initialized"
        );

        tokio::spawn(Self::engine_event_task(Arc::downgrade(&manager), events));

        manager
    }

    /// Background task applying engine lifecycle events
    async fn engine_event_task(
        manager: Weak<Self>,
        mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    ) {
        debug!("Starting engine event listener");
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_engine_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Engine event listener lagged, reconciling transports");
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.reconcile_transports().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Engine event listener stopped");
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::DtlsStateChanged {
                transport_id,
                state,
            } if state.is_terminal() => {
                warn!(transport_id = %transport_id, ?state, "Transport DTLS terminated");
                self.teardown_transport(&transport_id).await;
            }
            EngineEvent::DtlsStateChanged {
                transport_id,
                state,
            } => {
                debug!(transport_id = %transport_id, ?state, "Transport DTLS state changed");
            }
            EngineEvent::TransportClosed { transport_id } => {
                self.teardown_transport(&transport_id).await;
            }
            EngineEvent::ProducerClosed { producer_id } => {
                self.teardown_producer(&producer_id).await;
            }
        }
    }

    /// Tear down every registered transport the engine already considers
    /// dead. Recovers from lifecycle events lost to a lagging listener.
    async fn reconcile_transports(&self) {
        let dead: Vec<TransportId> = self
            .transports
            .filter(|_, entry| entry.transport.dtls_state().is_terminal())
            .into_iter()
            .map(|(transport_id, _)| transport_id)
            .collect();
        if !dead.is_empty() {
            info!(count = dead.len(), "Reconciling dead transports");
        }
        for transport_id in &dead {
            self.teardown_transport(transport_id).await;
        }
    }

    /// Register a new connection; its acknowledgement is queued immediately
    pub fn connect(&self, notifier: NotificationSender) -> ConnectionId {
        let id = ConnectionId::generate();
        let session = ParticipantSession::new(id.clone(), notifier);
        session.notify(Notification::ConnectionAck {
            connection_id: id.clone(),
        });
        self.sessions.insert(id.clone(), session);

        info!(connection_id = %id, sessions = self.sessions.len(), "Connection opened");
        id
    }

    /// Join (or create) a room and return its capability set
    pub async fn join_room(
        &self,
        id: &ConnectionId,
        room_name: &RoomName,
        details: PeerDetails,
    ) -> SfuResult<RtpCapabilities> {
        let current = self
            .sessions
            .get(id)
            .ok_or_else(|| unknown_connection(id))?
            .room
            .clone();
        match current {
            Some(current) if &current == room_name => {
                let room = self
                    .rooms
                    .get(room_name)
                    .ok_or_else(|| SfuError::InvalidState(format!("room {room_name} is gone")))?;
                return Ok(room.router.rtp_capabilities());
            }
            Some(current) => {
                return Err(SfuError::InvalidState(format!(
                    "already joined room {current}"
                )));
            }
            None => {}
        }

        let room = self.rooms.join(room_name, id).await?;

        let bound = match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.room = Some(room_name.clone());
                session.details = details;
                true
            }
            None => false,
        };
        if !bound {
            // Disconnected while the room was being resolved
            self.rooms.leave(room_name, id).await;
            return Err(unknown_connection(id));
        }

        info!(
            connection_id = %id,
            room = %room_name,
            members = room.member_count(),
            "Joined room"
        );
        Ok(room.router.rtp_capabilities())
    }

    /// Create a send (`consumer == false`) or receive transport
    pub async fn create_webrtc_transport(
        &self,
        id: &ConnectionId,
        consumer: bool,
    ) -> SfuResult<TransportInfo> {
        let room_name = self.joined_room(id)?;
        let direction = if consumer {
            TransportDirection::Receive
        } else {
            TransportDirection::Send
        };
        if direction == TransportDirection::Send && self.transports.send_transport_of(id).is_some()
        {
            return Err(SfuError::InvalidState(
                "send transport already exists".to_string(),
            ));
        }

        let room = self
            .rooms
            .get(&room_name)
            .ok_or_else(|| SfuError::InvalidState(format!("room {room_name} is gone")))?;
        let transport = self
            .bounded(
                "createWebRtcTransport",
                room.router
                    .create_webrtc_transport(self.config.transport.clone()),
            )
            .await?
            .map_err(|e| {
                warn!(connection_id = %id, error = %e, "Transport creation failed");
                SfuError::TransportCreationFailed(format!("{e:#}"))
            })?;
        let transport_id = transport.id();

        let registered = self.with_session_in_room(id, &room_name, |session| {
            if direction == TransportDirection::Send
                && self.transports.send_transport_of(id).is_some()
            {
                return Err(SfuError::InvalidState(
                    "send transport already exists".to_string(),
                ));
            }
            self.transports.insert(
                transport_id.clone(),
                TransportEntry {
                    transport: Arc::clone(&transport),
                    owner: id.clone(),
                    room: room_name.clone(),
                    direction,
                },
            );
            session.transports.push(transport_id.clone());
            Ok(())
        });
        if let Err(e) = registered {
            transport.close().await;
            return Err(e);
        }

        debug!(
            connection_id = %id,
            transport_id = %transport_id,
            ?direction,
            "Transport registered"
        );
        Ok(TransportInfo {
            id: transport_id,
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })
    }

    /// Connect the caller's send transport
    pub async fn connect_send_transport(
        &self,
        id: &ConnectionId,
        dtls_parameters: DtlsParameters,
    ) -> SfuResult<()> {
        let (transport_id, entry) = self
            .transports
            .send_transport_of(id)
            .ok_or_else(|| SfuError::InvalidState("no send transport".to_string()))?;

        self.bounded("transportConnect", entry.transport.connect(dtls_parameters))
            .await?
            .map_err(|e| SfuError::engine(&e))?;

        debug!(connection_id = %id, transport_id = %transport_id, "Send transport connected");
        Ok(())
    }

    /// Connect one of the caller's receive transports
    pub async fn connect_recv_transport(
        &self,
        id: &ConnectionId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> SfuResult<()> {
        let entry = self
            .transports
            .owned(transport_id, id, TransportDirection::Receive)
            .ok_or_else(|| SfuError::UnknownOwner(format!("transport {transport_id}")))?;

        self.bounded(
            "transportRecvConnect",
            entry.transport.connect(dtls_parameters),
        )
        .await?
        .map_err(|e| SfuError::engine(&e))?;

        debug!(connection_id = %id, transport_id = %transport_id, "Receive transport connected");
        Ok(())
    }

    /// Start sending media on the caller's send transport
    pub async fn produce(
        &self,
        id: &ConnectionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: serde_json::Value,
    ) -> SfuResult<ProduceOutcome> {
        let room_name = self.joined_room(id)?;
        let (transport_id, entry) = self.transports.send_transport_of(id).ok_or_else(|| {
            SfuError::InvalidState("create a send transport first".to_string())
        })?;
        let other_producers_exist = !self.producers.in_room_excluding(&room_name, id).is_empty();

        let producer = self
            .bounded("transportProduce", entry.transport.produce(kind, rtp_parameters))
            .await?
            .map_err(|e| SfuError::engine(&e))?;
        let producer_id = producer.id();

        let registered = self.with_session_in_room(id, &room_name, |session| {
            self.producers.insert(
                producer_id.clone(),
                ProducerEntry {
                    producer: Arc::clone(&producer),
                    owner: id.clone(),
                    room: room_name.clone(),
                    kind,
                    transport_id: transport_id.clone(),
                    app_data,
                },
            );
            session.producers.push(producer_id.clone());
            Ok(())
        });
        if let Err(e) = registered {
            producer.close().await;
            return Err(e);
        }

        // The send transport may have been torn down while the engine call ran
        if !self.transports.contains(&transport_id) {
            self.teardown_producer(&producer_id).await;
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} closed"
            )));
        }

        info!(
            connection_id = %id,
            room = %room_name,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        self.announce_producer(&room_name, id, &producer_id, kind);

        Ok(ProduceOutcome {
            producer_id,
            other_producers_exist,
        })
    }

    /// Tell every other room member about a new producer
    fn announce_producer(
        &self,
        room_name: &RoomName,
        owner: &ConnectionId,
        producer_id: &ProducerId,
        kind: MediaKind,
    ) {
        let mut notified = 0usize;
        for member in self.rooms.members(room_name) {
            if &member == owner {
                continue;
            }
            if let Some(session) = self.sessions.get(&member) {
                let sent = session.notify(Notification::NewProducer {
                    producer_id: producer_id.clone(),
                    owner: owner.clone(),
                    kind,
                });
                if sent {
                    notified += 1;
                }
            }
        }
        debug!(room = %room_name, producer_id = %producer_id, notified, "New producer announced");
    }

    /// Create a paused consumer of `producer_id` on one of the caller's receive transports
    pub async fn consume(
        &self,
        id: &ConnectionId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> SfuResult<ConsumerInfo> {
        let room_name = self.joined_room(id)?;
        let transport = self
            .transports
            .owned(transport_id, id, TransportDirection::Receive)
            .ok_or_else(|| SfuError::UnknownOwner(format!("transport {transport_id}")))?;
        self.producers
            .get(producer_id)
            .filter(|producer| producer.room == room_name)
            .ok_or_else(|| SfuError::InvalidState(format!("unknown producer {producer_id}")))?;

        let room = self
            .rooms
            .get(&room_name)
            .ok_or_else(|| SfuError::InvalidState(format!("room {room_name} is gone")))?;
        if !room.router.can_consume(producer_id, &rtp_capabilities) {
            debug!(connection_id = %id, producer_id = %producer_id, "Incompatible consume request");
            return Err(SfuError::IncompatibleMedia {
                producer_id: producer_id.clone(),
            });
        }

        let consumer = self
            .bounded(
                "consume",
                transport
                    .transport
                    .consume(producer_id.clone(), rtp_capabilities, true),
            )
            .await?
            .map_err(|e| SfuError::engine(&e))?;
        let consumer_id = consumer.id();

        let registered = self.with_session_in_room(id, &room_name, |session| {
            self.consumers.insert(
                consumer_id.clone(),
                ConsumerEntry {
                    consumer: Arc::clone(&consumer),
                    owner: id.clone(),
                    room: room_name.clone(),
                    producer_id: producer_id.clone(),
                    transport_id: transport_id.clone(),
                },
            );
            session.consumers.push(consumer_id.clone());
            Ok(())
        });
        if let Err(e) = registered {
            consumer.close().await;
            return Err(e);
        }

        // Either end may have been torn down while the engine call ran
        if !self.producers.contains(producer_id) {
            self.release_consumer(&consumer_id).await;
            return Err(SfuError::InvalidState(format!(
                "producer {producer_id} closed"
            )));
        }
        if !self.transports.contains(transport_id) {
            self.release_consumer(&consumer_id).await;
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} closed"
            )));
        }

        debug!(
            connection_id = %id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(ConsumerInfo {
            id: consumer_id.clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            server_consumer_id: consumer_id,
        })
    }

    pub async fn resume_consumer(&self, id: &ConnectionId, consumer_id: &ConsumerId) -> SfuResult<()> {
        let entry = self
            .consumers
            .get(consumer_id)
            .filter(|entry| &entry.owner == id)
            .ok_or_else(|| SfuError::UnknownOwner(format!("consumer {consumer_id}")))?;

        self.bounded("consumerResume", entry.consumer.resume())
            .await?
            .map_err(|e| SfuError::engine(&e))?;

        debug!(connection_id = %id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Producer ids in the caller's room, excluding the caller's own
    pub fn list_producers(&self, id: &ConnectionId) -> SfuResult<Vec<ProducerId>> {
        let room_name = self.joined_room(id)?;
        Ok(self
            .producers
            .in_room_excluding(&room_name, id)
            .into_iter()
            .map(|(producer_id, _)| producer_id)
            .collect())
    }

    /// Close one of the caller's producers
    pub async fn close_producer(&self, id: &ConnectionId, producer_id: &ProducerId) -> SfuResult<()> {
        self.producers
            .get(producer_id)
            .filter(|entry| &entry.owner == id)
            .ok_or_else(|| SfuError::UnknownOwner(format!("producer {producer_id}")))?;

        self.teardown_producer(producer_id).await;
        Ok(())
    }

    /// Close a producer, its consumers and any receive transport left idle,
    /// then notify the consumers' owners
    async fn teardown_producer(&self, producer_id: &ProducerId) {
        let Some(entry) = self.producers.remove(producer_id) else {
            return;
        };
        entry.producer.close().await;
        if let Some(mut owner) = self.sessions.get_mut(&entry.owner) {
            owner.forget_producer(producer_id);
        }

        let mut affected = HashSet::new();
        for (consumer_id, consumer) in self.consumers.bound_to(producer_id) {
            if !self.release_consumer(&consumer_id).await {
                continue;
            }
            if self.consumers.on_transport(&consumer.transport_id).is_empty() {
                self.release_transport(&consumer.transport_id).await;
            }
            affected.insert(consumer.owner);
        }

        for owner in &affected {
            if let Some(session) = self.sessions.get(owner) {
                session.notify(Notification::ProducerClosed {
                    producer_id: producer_id.clone(),
                });
            }
        }

        info!(
            producer_id = %producer_id,
            room = %entry.room,
            notified = affected.len(),
            "Producer closed"
        );
    }

    /// Close a transport and everything it carries
    async fn teardown_transport(&self, transport_id: &TransportId) {
        let Some(entry) = self.transports.remove(transport_id) else {
            return;
        };
        if let Some(mut owner) = self.sessions.get_mut(&entry.owner) {
            owner.forget_transport(transport_id);
        }

        for (producer_id, _) in self.producers.on_transport(transport_id) {
            self.teardown_producer(&producer_id).await;
        }
        for (consumer_id, _) in self.consumers.on_transport(transport_id) {
            self.release_consumer(&consumer_id).await;
        }
        entry.transport.close().await;

        info!(
            connection_id = %entry.owner,
            transport_id = %transport_id,
            "Transport torn down"
        );
    }

    /// Deregister and close one consumer; false if it was already gone
    async fn release_consumer(&self, consumer_id: &ConsumerId) -> bool {
        let Some(entry) = self.consumers.remove(consumer_id) else {
            return false;
        };
        if let Some(mut owner) = self.sessions.get_mut(&entry.owner) {
            owner.forget_consumer(consumer_id);
        }
        entry.consumer.close().await;
        true
    }

    async fn release_transport(&self, transport_id: &TransportId) {
        let Some(entry) = self.transports.remove(transport_id) else {
            return;
        };
        if let Some(mut owner) = self.sessions.get_mut(&entry.owner) {
            owner.forget_transport(transport_id);
        }
        entry.transport.close().await;
        debug!(transport_id = %transport_id, "Idle receive transport closed");
    }

    /// Release everything the connection owns and leave its room. Safe to call
    /// at any phase; a second call is a no-op.
    pub async fn disconnect(&self, id: &ConnectionId) {
        let Some((_, session)) = self.sessions.remove(id) else {
            debug!(connection_id = %id, "Disconnect for unknown connection");
            return;
        };

        for consumer_id in &session.consumers {
            self.release_consumer(consumer_id).await;
        }
        for producer_id in &session.producers {
            self.teardown_producer(producer_id).await;
        }
        for transport_id in &session.transports {
            if let Some(entry) = self.transports.remove(transport_id) {
                entry.transport.close().await;
            }
        }
        if let Some(room_name) = &session.room {
            self.rooms.leave(room_name, id).await;
        }

        info!(
            connection_id = %id,
            room = ?session.room,
            transports = session.transports.len(),
            producers = session.producers.len(),
            consumers = session.consumers.len(),
            "Connection closed"
        );
    }

    /// Disconnect every session and close all rooms
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.disconnect(id).await;
        }
        self.rooms.close_all().await;
        info!(closed_sessions = ids.len(), "SFU Manager shut down");
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            rooms: self.rooms.len(),
            sessions: self.sessions.len(),
            transports: self.transports.len(),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
        }
    }

    #[must_use]
    pub fn session(&self, id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|session| session.snapshot())
    }

    #[must_use]
    pub fn room_members(&self, room_name: &RoomName) -> Vec<ConnectionId> {
        self.rooms.members(room_name)
    }

    #[must_use]
    pub fn room(&self, room_name: &RoomName) -> Option<Arc<Room>> {
        self.rooms.get(room_name)
    }

    #[must_use]
    pub fn has_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.consumers.contains(consumer_id)
    }

    /// Paused state of a registered consumer
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.consumers
            .get(consumer_id)
            .map(|entry| entry.consumer.paused())
    }

    fn joined_room(&self, id: &ConnectionId) -> SfuResult<RoomName> {
        self.sessions
            .get(id)
            .ok_or_else(|| unknown_connection(id))?
            .room
            .clone()
            .ok_or_else(|| SfuError::InvalidState("join a room first".to_string()))
    }

    /// Run `register` under the session entry if the connection is still in `room_name`
    fn with_session_in_room(
        &self,
        id: &ConnectionId,
        room_name: &RoomName,
        register: impl FnOnce(&mut ParticipantSession) -> SfuResult<()>,
    ) -> SfuResult<()> {
        match self.sessions.get_mut(id) {
            Some(mut session) if session.room.as_ref() == Some(room_name) => register(&mut session),
            _ => Err(SfuError::InvalidState(
                "connection left the room".to_string(),
            )),
        }
    }

    async fn bounded<F: Future>(&self, phase: &'static str, fut: F) -> SfuResult<F::Output> {
        tokio::time::timeout(self.config.handshake_timeout, fut)
            .await
            .map_err(|_| {
                warn!(phase, "Handshake phase timed out");
                SfuError::HandshakeTimeout { phase }
            })
    }
}

fn unknown_connection(id: &ConnectionId) -> SfuError {
    SfuError::InvalidState(format!("unknown connection {id}"))
}
