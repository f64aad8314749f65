//! Participant sessions
//!
//! One session per live signaling connection. The session lists every
//! transport, producer and consumer the connection owns; the registries hold
//! the same identifiers, and both sides are updated under the session's map
//! entry so they never disagree.

use crate::media::MediaKind;
use crate::types::{ConnectionId, ConsumerId, ProducerId, RoomName, TransportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Display metadata supplied on join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDetails {
    pub name: Option<String>,
    pub is_admin: bool,
}

/// Server-push message for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectionAck {
        connection_id: ConnectionId,
    },
    NewProducer {
        producer_id: ProducerId,
        owner: ConnectionId,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

pub struct ParticipantSession {
    pub id: ConnectionId,
    pub room: Option<RoomName>,
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub details: PeerDetails,
    pub connected_at: DateTime<Utc>,
    notifier: NotificationSender,
}

impl ParticipantSession {
    #[must_use]
    pub fn new(id: ConnectionId, notifier: NotificationSender) -> Self {
        Self {
            id,
            room: None,
            transports: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            details: PeerDetails::default(),
            connected_at: Utc::now(),
            notifier,
        }
    }

    /// Queue a notification; returns false once the connection is gone
    pub fn notify(&self, notification: Notification) -> bool {
        if self.notifier.send(notification).is_err() {
            debug!(connection_id = %self.id, "Notification dropped, connection closed");
            return false;
        }
        true
    }

    pub fn forget_transport(&mut self, id: &TransportId) {
        self.transports.retain(|t| t != id);
    }

    pub fn forget_producer(&mut self, id: &ProducerId) {
        self.producers.retain(|p| p != id);
    }

    pub fn forget_consumer(&mut self, id: &ConsumerId) {
        self.consumers.retain(|c| c != id);
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            room: self.room.clone(),
            transports: self.transports.clone(),
            producers: self.producers.clone(),
            consumers: self.consumers.clone(),
            details: self.details.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Read-only copy of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub room: Option<RoomName>,
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub details: PeerDetails,
    pub connected_at: DateTime<Utc>,
}
