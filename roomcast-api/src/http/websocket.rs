//! WebSocket transport for the signaling handler
//!
//! JSON text frames in both directions. All protocol logic lives in
//! `impls::signaling`; this module only adapts axum's socket to
//! `SignalingStream`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::http::AppState;
use crate::impls::SignalingStream;
use crate::protocol::ServerMessage;

/// Outbound frames buffered per connection before the client counts as stalled
const OUTBOUND_BUFFER: usize = 1000;

struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl SignalingStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                // Ping/pong are answered by axum; binary frames are not part of the protocol
                Some(Ok(_)) => {}
            }
        }
    }

    fn send(&self, message: &ServerMessage) -> Result<(), String> {
        let text = message.encode().map_err(|e| e.to_string())?;
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }
}

/// Signaling endpoint
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: tx,
    };
    state.signaling.run(&mut stream).await;

    // Dropping the stream closes the outbound channel and lets the writer flush
    drop(stream);
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
}
