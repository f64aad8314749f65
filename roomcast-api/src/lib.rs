// roomcast-api - signaling and HTTP surface for roomcast
//
// - protocol.rs - JSON request/response/notification frames
// - impls/      - per-connection signaling handler over any frame stream
// - http/       - axum router: WebSocket endpoint, client bundle, feed files, health

pub mod http;
pub mod impls;
pub mod protocol;

pub use http::{create_router, AppState};
pub use impls::{SignalingHandler, SignalingStream};
