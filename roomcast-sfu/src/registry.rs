//! Transport, producer and consumer registries
//!
//! Each registry is a concurrent map with atomic insert/remove. Queries return
//! cloned snapshots so no shard guard outlives the call.

use crate::engine::{Consumer, Producer, WebRtcTransport};
use crate::media::MediaKind;
use crate::types::{ConnectionId, ConsumerId, ProducerId, RoomName, TransportId};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

pub struct Registry<K, V> {
    entries: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the entries matching `predicate`
    pub fn filter(&self, predicate: impl Fn(&K, &V) -> bool) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter(|entry| predicate(entry.key(), entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Receive,
}

#[derive(Clone)]
pub struct TransportEntry {
    pub transport: Arc<dyn WebRtcTransport>,
    pub owner: ConnectionId,
    pub room: RoomName,
    pub direction: TransportDirection,
}

#[derive(Clone)]
pub struct ProducerEntry {
    pub producer: Arc<dyn Producer>,
    pub owner: ConnectionId,
    pub room: RoomName,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub app_data: serde_json::Value,
}

#[derive(Clone)]
pub struct ConsumerEntry {
    pub consumer: Arc<dyn Consumer>,
    pub owner: ConnectionId,
    pub room: RoomName,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
}

pub type TransportRegistry = Registry<TransportId, TransportEntry>;
pub type ProducerRegistry = Registry<ProducerId, ProducerEntry>;
pub type ConsumerRegistry = Registry<ConsumerId, ConsumerEntry>;

impl TransportRegistry {
    /// The single send transport a connection may hold
    #[must_use]
    pub fn send_transport_of(&self, owner: &ConnectionId) -> Option<(TransportId, TransportEntry)> {
        self.filter(|_, entry| {
            entry.direction == TransportDirection::Send && &entry.owner == owner
        })
        .into_iter()
        .next()
    }

    /// A transport owned by `owner` in the given direction
    #[must_use]
    pub fn owned(
        &self,
        id: &TransportId,
        owner: &ConnectionId,
        direction: TransportDirection,
    ) -> Option<TransportEntry> {
        self.get(id)
            .filter(|entry| &entry.owner == owner && entry.direction == direction)
    }
}

impl ProducerRegistry {
    /// Producers in `room` owned by anyone but `owner`
    #[must_use]
    pub fn in_room_excluding(
        &self,
        room: &RoomName,
        owner: &ConnectionId,
    ) -> Vec<(ProducerId, ProducerEntry)> {
        self.filter(|_, entry| &entry.room == room && &entry.owner != owner)
    }

    #[must_use]
    pub fn on_transport(&self, transport_id: &TransportId) -> Vec<(ProducerId, ProducerEntry)> {
        self.filter(|_, entry| &entry.transport_id == transport_id)
    }
}

impl ConsumerRegistry {
    #[must_use]
    pub fn bound_to(&self, producer_id: &ProducerId) -> Vec<(ConsumerId, ConsumerEntry)> {
        self.filter(|_, entry| &entry.producer_id == producer_id)
    }

    #[must_use]
    pub fn on_transport(&self, transport_id: &TransportId) -> Vec<(ConsumerId, ConsumerEntry)> {
        self.filter(|_, entry| &entry.transport_id == transport_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockProducer;

    fn producer_entry(owner: &str, room: &str, transport: &str) -> ProducerEntry {
        ProducerEntry {
            producer: Arc::new(MockProducer::new()),
            owner: ConnectionId::from(owner),
            room: RoomName::from(room),
            kind: MediaKind::Audio,
            transport_id: TransportId::from(transport),
            app_data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let registry: Registry<String, u32> = Registry::new();
        assert!(registry.insert("a".to_string(), 1).is_none());
        assert_eq!(registry.insert("a".to_string(), 2), Some(1));
        assert_eq!(registry.get(&"a".to_string()), Some(2));
        assert_eq!(registry.remove(&"a".to_string()), Some(2));
        assert!(registry.remove(&"a".to_string()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_producers_in_room_excluding_owner() {
        let registry = ProducerRegistry::new();
        registry.insert(ProducerId::from("p1"), producer_entry("a", "r1", "t1"));
        registry.insert(ProducerId::from("p2"), producer_entry("b", "r1", "t2"));
        registry.insert(ProducerId::from("p3"), producer_entry("c", "r2", "t3"));

        let others = registry.in_room_excluding(&RoomName::from("r1"), &ConnectionId::from("a"));
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, ProducerId::from("p2"));

        assert_eq!(registry.on_transport(&TransportId::from("t3")).len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_are_all_kept() {
        let registry = Arc::new(Registry::<u32, u32>::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.insert(t * 100 + i, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }
}
