// Module: http
// axum surface: signaling WebSocket, client bundle, feed output, health

pub mod error;
pub mod health;
pub mod room;
pub mod websocket;

use axum::{routing::get, Router};
use roomcast_livestream::FeedBridge;
use roomcast_sfu::SfuManager;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::impls::SignalingHandler;

pub use error::{AppError, AppResult};

const ROOM_HINT: &str =
    "You need to specify a room name in the path e.g. 'https://127.0.0.1/broadcast/room'";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub feed: Arc<FeedBridge>,
    pub signaling: SignalingHandler,
    /// Client bundle served under `/broadcast/{room}`
    pub public_dir: PathBuf,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(
        manager: Arc<SfuManager>,
        feed: Arc<FeedBridge>,
        public_dir: impl Into<PathBuf>,
        max_message_size: usize,
    ) -> Self {
        let signaling = SignalingHandler::new(Arc::clone(&manager), Arc::clone(&feed));
        Self {
            manager,
            feed,
            signaling,
            public_dir: public_dir.into(),
            max_message_size,
        }
    }
}

/// Build the complete HTTP router
pub fn create_router(state: AppState) -> Router {
    let files = ServeDir::new(state.feed.files_dir());
    let public = ServeDir::new(&state.public_dir);

    Router::new()
        .route("/mediasoup", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .merge(room::create_room_router())
        // Feed output is room-namespaced in the URL but shared on disk
        .nest(
            "/broadcast/{room}",
            Router::new()
                .nest_service("/files", files)
                .fallback_service(public),
        )
        .fallback(room_hint)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn room_hint() -> &'static str {
    ROOM_HINT
}
