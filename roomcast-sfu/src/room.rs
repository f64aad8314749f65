//! Room directory
//!
//! Maps room names to their router and member set. A router is created at
//! most once per room name: creators serialize on a per-name lock and re-check
//! the directory after acquiring it.

use crate::engine::{MediaEngine, Router};
use crate::error::{SfuError, SfuResult};
use crate::media::RtpCodecCapability;
use crate::types::{ConnectionId, RoomName};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

pub struct Room {
    pub name: RoomName,
    pub router: Arc<dyn Router>,
    members: Mutex<HashSet<ConnectionId>>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }
}

#[derive(Debug, Clone)]
pub struct RoomLimits {
    pub max_rooms: usize,
    pub max_peers_per_room: usize,
    pub close_empty_rooms: bool,
    pub router_timeout: Duration,
}

pub struct RoomDirectory {
    engine: Arc<dyn MediaEngine>,
    media_codecs: Vec<RtpCodecCapability>,
    limits: RoomLimits,
    rooms: DashMap<RoomName, Arc<Room>>,
    /// Per-name creation locks, so only one router is built per room
    creation_locks: DashMap<RoomName, Arc<AsyncMutex<()>>>,
}

impl RoomDirectory {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        media_codecs: Vec<RtpCodecCapability>,
        limits: RoomLimits,
    ) -> Self {
        Self {
            engine,
            media_codecs,
            limits,
            rooms: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Add `participant` to `name`, creating the room and its router if needed
    pub async fn join(&self, name: &RoomName, participant: &ConnectionId) -> SfuResult<Arc<Room>> {
        if let Some(room) = self.try_join_existing(name, participant)? {
            return Ok(room);
        }

        let lock = self
            .creation_locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.try_join_existing(name, participant) {
                Ok(Some(room)) => Ok(room),
                Ok(None) => self.create_room(name, participant).await,
                Err(e) => Err(e),
            }
        };

        // Drop the lock entry once nobody else is waiting on it
        drop(lock);
        self.creation_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Add to an existing room while holding its directory shard, so a
    /// concurrent `leave` cannot remove the room in between
    fn try_join_existing(
        &self,
        name: &RoomName,
        participant: &ConnectionId,
    ) -> SfuResult<Option<Arc<Room>>> {
        let Some(entry) = self.rooms.get(name) else {
            return Ok(None);
        };
        let room = entry.value();

        let mut members = room.members.lock();
        if self.limits.max_peers_per_room > 0
            && members.len() >= self.limits.max_peers_per_room
            && !members.contains(participant)
        {
            warn!(
                room = %name,
                current_peers = members.len(),
                max_peers = self.limits.max_peers_per_room,
                "Peer limit reached for room"
            );
            return Err(SfuError::CapacityExceeded(format!("room {name} is full")));
        }
        members.insert(participant.clone());
        debug!(room = %name, connection_id = %participant, members = members.len(), "Joined existing room");

        Ok(Some(Arc::clone(room)))
    }

    async fn create_room(&self, name: &RoomName, participant: &ConnectionId) -> SfuResult<Arc<Room>> {
        if self.limits.max_rooms > 0 && self.rooms.len() >= self.limits.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.limits.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::CapacityExceeded(
                "maximum number of rooms reached".to_string(),
            ));
        }

        let router = match tokio::time::timeout(
            self.limits.router_timeout,
            self.engine.create_router(self.media_codecs.clone()),
        )
        .await
        {
            Ok(Ok(router)) => router,
            Ok(Err(e)) => {
                warn!(room = %name, error = %e, "Router creation failed");
                return Err(SfuError::RoomUnavailable {
                    room: name.clone(),
                    reason: format!("{e:#}"),
                });
            }
            Err(_) => {
                warn!(room = %name, "Router creation timed out");
                return Err(SfuError::RoomUnavailable {
                    room: name.clone(),
                    reason: "router creation timed out".to_string(),
                });
            }
        };

        let room = Arc::new(Room {
            name: name.clone(),
            router,
            members: Mutex::new(HashSet::from([participant.clone()])),
            created_at: Utc::now(),
        });
        self.rooms.insert(name.clone(), Arc::clone(&room));

        info!(
            room = %name,
            router_id = %room.router.id(),
            total_rooms = self.rooms.len(),
            "Created new room"
        );
        Ok(room)
    }

    /// Remove `participant` from `name`; tears the room down when it empties
    pub async fn leave(&self, name: &RoomName, participant: &ConnectionId) {
        let close_empty = self.limits.close_empty_rooms;
        // Membership change and removal happen under the shard write lock
        let removed = self.rooms.remove_if(name, |_, room| {
            let mut members = room.members.lock();
            members.remove(participant);
            close_empty && members.is_empty()
        });

        if let Some((_, room)) = removed {
            room.router.close().await;
            info!(
                room = %name,
                remaining_rooms = self.rooms.len(),
                "Closed empty room"
            );
        } else {
            debug!(room = %name, connection_id = %participant, "Left room");
        }
    }

    #[must_use]
    pub fn get(&self, name: &RoomName) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn members(&self, name: &RoomName) -> Vec<ConnectionId> {
        self.get(name).map(|room| room.members()).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Close every router, used on shutdown
    pub async fn close_all(&self) {
        let names: Vec<RoomName> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, room)) = self.rooms.remove(&name) {
                room.router.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::engine::{LocalMediaEngine, MockMediaEngine, MockRouter};
    use crate::types::RouterId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits() -> RoomLimits {
        RoomLimits {
            max_rooms: 0,
            max_peers_per_room: 0,
            close_empty_rooms: true,
            router_timeout: Duration::from_secs(5),
        }
    }

    fn directory(limits: RoomLimits) -> RoomDirectory {
        RoomDirectory::new(
            Arc::new(LocalMediaEngine::default()),
            default_media_codecs(),
            limits,
        )
    }

    #[tokio::test]
    async fn test_join_reuses_router() {
        let rooms = directory(limits());
        let name = RoomName::from("r1");

        let first = rooms.join(&name, &ConnectionId::from("a")).await.unwrap();
        let second = rooms.join(&name, &ConnectionId::from("b")).await.unwrap();

        assert_eq!(first.router.id(), second.router.id());
        assert_eq!(first.member_count(), 2);
        assert_eq!(rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_keeps_other_members() {
        let rooms = directory(limits());
        let name = RoomName::from("r1");
        rooms.join(&name, &ConnectionId::from("a")).await.unwrap();
        rooms.join(&name, &ConnectionId::from("b")).await.unwrap();

        rooms.leave(&name, &ConnectionId::from("a")).await;
        assert_eq!(rooms.members(&name), vec![ConnectionId::from("b")]);

        rooms.leave(&name, &ConnectionId::from("b")).await;
        assert!(rooms.get(&name).is_none());
    }

    #[tokio::test]
    async fn test_empty_room_kept_when_configured() {
        let rooms = directory(RoomLimits {
            close_empty_rooms: false,
            ..limits()
        });
        let name = RoomName::from("r1");
        rooms.join(&name, &ConnectionId::from("a")).await.unwrap();
        rooms.leave(&name, &ConnectionId::from("a")).await;

        let room = rooms.get(&name).unwrap();
        assert_eq!(room.member_count(), 0);
    }

    #[tokio::test]
    async fn test_router_failure_is_room_unavailable() {
        let mut engine = MockMediaEngine::new();
        engine
            .expect_create_router()
            .returning(|_| Err(anyhow::anyhow!("worker died")));
        let rooms = RoomDirectory::new(Arc::new(engine), default_media_codecs(), limits());

        let err = rooms
            .join(&RoomName::from("r1"), &ConnectionId::from("a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SfuError::RoomUnavailable { .. }));
        assert!(rooms.is_empty());
    }

    #[tokio::test]
    async fn test_limits_enforced() {
        let rooms = directory(RoomLimits {
            max_rooms: 1,
            max_peers_per_room: 1,
            ..limits()
        });
        rooms
            .join(&RoomName::from("r1"), &ConnectionId::from("a"))
            .await
            .unwrap();

        let full = rooms
            .join(&RoomName::from("r1"), &ConnectionId::from("b"))
            .await;
        assert!(matches!(full, Err(SfuError::CapacityExceeded(_))));

        let too_many = rooms
            .join(&RoomName::from("r2"), &ConnectionId::from("c"))
            .await;
        assert!(matches!(too_many, Err(SfuError::CapacityExceeded(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_create_one_router() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut engine = MockMediaEngine::new();
        let counter = Arc::clone(&created);
        engine.expect_create_router().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut router = MockRouter::new();
            router
                .expect_id()
                .returning(|| RouterId::from("router-1"));
            Ok(Arc::new(router) as Arc<dyn Router>)
        });
        let rooms = Arc::new(RoomDirectory::new(
            Arc::new(engine),
            default_media_codecs(),
            limits(),
        ));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rooms = Arc::clone(&rooms);
                tokio::spawn(async move {
                    rooms
                        .join(&RoomName::from("shared"), &ConnectionId::new(format!("c{i}")))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(rooms.members(&RoomName::from("shared")).len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_membership() {
        let rooms = Arc::new(directory(RoomLimits {
            close_empty_rooms: false,
            ..limits()
        }));
        let name = RoomName::from("churn");

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let rooms = Arc::clone(&rooms);
                let name = name.clone();
                tokio::spawn(async move {
                    let id = ConnectionId::new(format!("c{i}"));
                    rooms.join(&name, &id).await.unwrap();
                    if i % 2 == 0 {
                        rooms.leave(&name, &id).await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut members = rooms.members(&name);
        members.sort();
        let mut expected: Vec<_> = (0..32)
            .filter(|i| i % 2 == 1)
            .map(|i| ConnectionId::new(format!("c{i}")))
            .collect();
        expected.sort();
        assert_eq!(members, expected);
    }
}
