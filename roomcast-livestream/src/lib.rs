// roomcast-livestream - External feed bridge for roomcast
//
// Converts one pull-based source (RTSP) into a segmented playlist that the
// HTTP layer serves read-only under the room's path.
//
// - source.rs - stream name parsing and converter argument rendering
// - bridge.rs - single-slot supervision of the converter process
//
// A feed is owned by the connection that requested it and is terminated
// when that connection goes away.

pub mod bridge;
pub mod error;
pub mod source;

pub use bridge::{FeedBridge, FeedBridgeConfig, FeedSession, FeedStatus, SlotPolicy};
pub use error::{FeedError, FeedResult};
pub use source::parse_stream_name;
