//! Roomcast SFU (Selective Forwarding Unit) signaling core
//!
//! Tracks rooms, participants, transports, producers and consumers, and drives
//! the handshake that lets every participant's media reach every other
//! participant through a server-side media engine.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: per-connection handshake state machine and teardown
//! - **`RoomDirectory`**: room name → router and member set
//! - **`Registry`**: concurrent transport/producer/consumer registries
//! - **`MediaEngine`**: the routing engine behind a trait, with
//!   `LocalMediaEngine` as the in-process implementation
//!
//! ## Handshake
//!
//! 1. `join_room` returns the room's RTP capabilities
//! 2. `create_webrtc_transport` (one send, any number of receive transports)
//! 3. `connect_send_transport` / `connect_recv_transport`
//! 4. `produce` announces the producer to the rest of the room
//! 5. `consume` creates a paused consumer, `resume_consumer` starts it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{LocalMediaEngine, SfuConfig, SfuManager};
//!
//! let manager = SfuManager::new(SfuConfig::default(), Arc::new(LocalMediaEngine::default()));
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let id = manager.connect(tx);
//! let capabilities = manager.join_room(&id, &"lobby".into(), Default::default()).await?;
//! ```

mod config;
pub mod engine;
mod error;
mod manager;
pub mod media;
mod peer;
mod registry;
mod room;
mod types;

pub use config::{default_media_codecs, SfuConfig, WebRtcTransportOptions};
pub use engine::{EngineEvent, LocalMediaEngine, MediaEngine};
pub use error::{SfuError, SfuResult};
pub use manager::{ConsumerInfo, ManagerStats, ProduceOutcome, SfuManager, TransportInfo};
pub use media::MediaKind;
pub use peer::{Notification, NotificationReceiver, NotificationSender, PeerDetails, SessionInfo};
pub use registry::{Registry, TransportDirection};
pub use room::{Room, RoomDirectory, RoomLimits};
pub use types::{ConnectionId, ConsumerId, ProducerId, RoomName, RouterId, TransportId};
