//! Per-connection signaling handler
//!
//! Transport-agnostic: the WebSocket layer only supplies a `SignalingStream`.
//! Requests on one connection are handled strictly in order and each response
//! is written before any notification queued during the call, so a client
//! always sees `produce`'s answer before the events it caused.

use crate::protocol::{
    AckResponse, ClientRequest, ConsumeResponse, JoinRoomResponse, LoadRtspResponse,
    ProduceResponse, RequestEnvelope, ServerMessage, TransportResponse,
};
use roomcast_livestream::{FeedBridge, FeedError};
use roomcast_sfu::{ConnectionId, PeerDetails, RoomName, SfuError, SfuManager};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frame-level IO for one client connection
#[async_trait::async_trait]
pub trait SignalingStream: Send {
    /// Next text frame; `None` once the client is gone
    async fn recv(&mut self) -> Option<Result<String, String>>;

    fn send(&self, message: &ServerMessage) -> Result<(), String>;
}

#[derive(Error, Debug)]
enum HandlerError {
    #[error(transparent)]
    Sfu(#[from] SfuError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Shared by every connection; `run` drives one of them
#[derive(Clone)]
pub struct SignalingHandler {
    manager: Arc<SfuManager>,
    feed: Arc<FeedBridge>,
}

impl SignalingHandler {
    pub const fn new(manager: Arc<SfuManager>, feed: Arc<FeedBridge>) -> Self {
        Self { manager, feed }
    }

    /// Serve one connection until the client leaves, then tear its state down
    pub async fn run<S: SignalingStream>(&self, stream: &mut S) {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let id = self.manager.connect(notify_tx);
        info!(connection_id = %id, "Signaling connection established");

        loop {
            tokio::select! {
                // Queued notifications go out first, which also puts
                // connectionSuccess ahead of any response.
                biased;

                notification = notify_rx.recv() => {
                    let Some(notification) = notification else {
                        break;
                    };
                    if let Err(e) = stream.send(&ServerMessage::from(notification)) {
                        warn!(connection_id = %id, error = %e, "Failed to push notification");
                        break;
                    }
                }

                frame = stream.recv() => match frame {
                    Some(Ok(text)) => {
                        if let Some(reply) = self.handle_frame(&id, &text).await {
                            if let Err(e) = stream.send(&reply) {
                                warn!(connection_id = %id, error = %e, "Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %id, error = %e, "Error receiving frame");
                        break;
                    }
                    None => {
                        debug!(connection_id = %id, "Client closed connection");
                        break;
                    }
                },
            }
        }

        self.manager.disconnect(&id).await;
        if self.feed.release_for(id.as_str()).await {
            info!(connection_id = %id, "Feed owned by connection stopped");
        }
        info!(connection_id = %id, "Signaling connection closed");
    }

    /// Decode and execute one frame; `None` means nothing goes back on the wire
    pub async fn handle_frame(&self, id: &ConnectionId, frame: &str) -> Option<ServerMessage> {
        let envelope = match RequestEnvelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Dropping malformed frame");
                return Some(ServerMessage::error(None, e.to_string()));
            }
        };
        let request_id = envelope.request_id;

        let request = match ClientRequest::decode(&envelope.method, envelope.params) {
            Ok(request) => request,
            Err(e) => {
                warn!(connection_id = %id, method = %envelope.method, error = %e, "Rejected request");
                return Some(ServerMessage::error(request_id, e.to_string()));
            }
        };

        let method = request.method();
        let expects_response = request.expects_response();
        let result = self.dispatch(id, request).await;

        match result {
            Ok(reply) if expects_response => Some(reply.with_request_id(request_id)),
            Ok(_) => None,
            Err(e) => {
                warn!(connection_id = %id, method, error = %e, "Request failed");
                expects_response.then(|| ServerMessage::error(request_id, e.to_string()))
            }
        }
    }

    async fn dispatch(&self, id: &ConnectionId, request: ClientRequest) -> Result<Reply, HandlerError> {
        let reply = match request {
            ClientRequest::JoinRoom(params) => {
                let details = PeerDetails {
                    name: params.display_name,
                    is_admin: params.is_admin,
                };
                let rtp_capabilities = self
                    .manager
                    .join_room(id, &RoomName::new(params.room_name), details)
                    .await?;
                Reply::of(&JoinRoomResponse { rtp_capabilities })?
            }
            ClientRequest::CreateWebRtcTransport(params) => {
                let info = self
                    .manager
                    .create_webrtc_transport(id, params.consumer)
                    .await?;
                Reply::of(&TransportResponse { params: info })?
            }
            ClientRequest::TransportConnect(params) => {
                self.manager
                    .connect_send_transport(id, params.dtls_parameters)
                    .await?;
                Reply::of(&AckResponse { ok: true })?
            }
            ClientRequest::TransportRecvConnect(params) => {
                self.manager
                    .connect_recv_transport(
                        id,
                        &params.server_consumer_transport_id,
                        params.dtls_parameters,
                    )
                    .await?;
                Reply::of(&AckResponse { ok: true })?
            }
            ClientRequest::TransportProduce(params) => {
                let outcome = self
                    .manager
                    .produce(id, params.kind, params.rtp_parameters, params.app_data)
                    .await?;
                Reply::of(&ProduceResponse {
                    id: outcome.producer_id,
                    producers_exist: outcome.other_producers_exist,
                })?
            }
            ClientRequest::Consume(params) => {
                let info = self
                    .manager
                    .consume(
                        id,
                        &params.server_consumer_transport_id,
                        &params.remote_producer_id,
                        params.rtp_capabilities,
                    )
                    .await?;
                Reply::of(&ConsumeResponse { params: info })?
            }
            ClientRequest::ConsumerResume(params) => {
                self.manager
                    .resume_consumer(id, &params.server_consumer_id)
                    .await?;
                Reply::empty()
            }
            ClientRequest::GetProducers => Reply::of(&self.manager.list_producers(id)?)?,
            ClientRequest::CloseProducer(params) => {
                self.manager.close_producer(id, &params.producer_id).await?;
                Reply::of(&AckResponse { ok: true })?
            }
            ClientRequest::LoadRtsp(params) => {
                let session = self.feed.ingest(id.as_str(), &params.rtsp_url).await?;
                if let Some(requested) = params
                    .stream_name
                    .filter(|requested| requested != &session.stream_name)
                {
                    warn!(
                        connection_id = %id,
                        requested = %requested,
                        stream = %session.stream_name,
                        "Ignoring client stream name, using the one from the URL"
                    );
                }
                Reply::of(&LoadRtspResponse {
                    status: "started",
                    stream_name: session.stream_name,
                })?
            }
        };
        Ok(reply)
    }
}

/// Response payload waiting for its request id
struct Reply(serde_json::Value);

impl Reply {
    fn of<T: serde::Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(data).map(Self)
    }

    const fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    fn with_request_id(self, request_id: Option<u64>) -> ServerMessage {
        ServerMessage::Response {
            request_id,
            data: self.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_livestream::FeedBridgeConfig;
    use roomcast_sfu::{LocalMediaEngine, SfuConfig};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Scripted client: replays frames, records everything sent back
    struct ScriptedStream {
        frames: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl SignalingStream for ScriptedStream {
        async fn recv(&mut self) -> Option<Result<String, String>> {
            self.frames.recv().await.map(Ok)
        }

        fn send(&self, message: &ServerMessage) -> Result<(), String> {
            let value = serde_json::to_value(message).map_err(|e| e.to_string())?;
            self.sent.lock().unwrap().push(value);
            Ok(())
        }
    }

    /// Parks inside `send` on the first response until resumed, keeping that
    /// reply in flight while other connections act
    struct ParkedReplyStream {
        inner: ScriptedStream,
        park: Mutex<Option<(oneshot::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
    }

    #[async_trait::async_trait]
    impl SignalingStream for ParkedReplyStream {
        async fn recv(&mut self) -> Option<Result<String, String>> {
            self.inner.recv().await
        }

        fn send(&self, message: &ServerMessage) -> Result<(), String> {
            if matches!(message, ServerMessage::Response { .. }) {
                let park = self.park.lock().unwrap().take();
                if let Some((parked, resume)) = park {
                    let _ = parked.send(());
                    let _ = resume.recv();
                }
            }
            self.inner.send(message)
        }
    }

    fn handler(dir: &TempDir) -> SignalingHandler {
        let manager = SfuManager::new(SfuConfig::default(), Arc::new(LocalMediaEngine::default()));
        let feed = FeedBridge::new(FeedBridgeConfig {
            program: "sleep".to_string(),
            pipeline: "30".to_string(),
            files_dir: dir.path().join("files"),
            terminate_grace: std::time::Duration::from_secs(2),
            ..FeedBridgeConfig::default()
        });
        SignalingHandler::new(manager, feed)
    }

    fn connect(handler: &SignalingHandler) -> ConnectionId {
        let (tx, _rx) = mpsc::unbounded_channel();
        handler.manager.connect(tx)
    }

    fn data(message: Option<ServerMessage>) -> (Option<u64>, Value) {
        match message {
            Some(ServerMessage::Response { request_id, data }) => (request_id, data),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_answers_with_null_request_id() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        let (request_id, body) = data(handler.handle_frame(&id, "{oops").await);
        assert_eq!(request_id, None);
        assert!(body["error"].as_str().unwrap().contains("Malformed"));
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_request_id() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        let (request_id, body) = data(
            handler
                .handle_frame(&id, r#"{"requestId": 4, "method": "restartIce"}"#)
                .await,
        );
        assert_eq!(request_id, Some(4));
        assert!(body["error"].as_str().unwrap().contains("restartIce"));
    }

    #[tokio::test]
    async fn test_join_and_create_transport() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        let (request_id, body) = data(
            handler
                .handle_frame(
                    &id,
                    r#"{"requestId": 1, "method": "joinRoom", "params": {"roomName": "r1"}}"#,
                )
                .await,
        );
        assert_eq!(request_id, Some(1));
        assert!(body["rtpCapabilities"]["codecs"].as_array().unwrap().len() >= 2);

        let (_, body) = data(
            handler
                .handle_frame(
                    &id,
                    r#"{"requestId": 2, "method": "createWebRtcTransport", "params": {"consumer": false}}"#,
                )
                .await,
        );
        assert!(body["params"]["id"].is_string());
        assert!(body["params"]["iceParameters"]["usernameFragment"].is_string());
        assert!(body["params"]["dtlsParameters"]["fingerprints"].is_array());
    }

    #[tokio::test]
    async fn test_errors_become_error_payloads() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        // Not joined yet
        let (_, body) = data(
            handler
                .handle_frame(&id, r#"{"requestId": 1, "method": "getProducers"}"#)
                .await,
        );
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_consumer_resume_never_answers() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        let reply = handler
            .handle_frame(
                &id,
                r#"{"requestId": 5, "method": "consumerResume", "params": {"serverConsumerId": "missing"}}"#,
            )
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_load_rtsp_rejects_bad_url() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let id = connect(&handler);

        let (_, body) = data(
            handler
                .handle_frame(
                    &id,
                    r#"{"requestId": 8, "method": "loadRtsp", "params": {"rtspUrl": "rtsp://host/path/noext"}}"#,
                )
                .await,
        );
        assert!(body["error"].as_str().unwrap().contains("Invalid source URL"));
        assert!(!dir.path().join("files").exists());
    }

    #[tokio::test]
    async fn test_run_sends_connection_success_first_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut stream = ScriptedStream {
            frames,
            sent: Arc::clone(&sent),
        };

        frames_tx
            .send(r#"{"requestId": 1, "method": "joinRoom", "params": {"roomName": "lobby"}}"#.to_string())
            .unwrap();
        drop(frames_tx);

        handler.run(&mut stream).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0]["type"], "connectionSuccess");
        assert!(sent[0]["socketId"].is_string());
        assert_eq!(sent[1]["type"], "response");
        assert_eq!(sent[1]["requestId"], 1);
        assert!(sent[1]["data"]["rtpCapabilities"].is_object());

        // Connection is gone after the stream ends
        assert_eq!(handler.manager.stats().sessions, 0);
        assert_eq!(handler.manager.stats().rooms, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_reply_precedes_new_producer() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);

        let a = connect(&handler);
        handler
            .handle_frame(&a, r#"{"requestId": 1, "method": "joinRoom", "params": {"roomName": "r1"}}"#)
            .await;
        handler
            .handle_frame(
                &a,
                r#"{"requestId": 2, "method": "createWebRtcTransport", "params": {"consumer": false}}"#,
            )
            .await;

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (parked_tx, parked_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel();
        let mut stream = ParkedReplyStream {
            inner: ScriptedStream {
                frames,
                sent: Arc::clone(&sent),
            },
            park: Mutex::new(Some((parked_tx, resume_rx))),
        };
        let b = tokio::spawn({
            let handler = handler.clone();
            async move { handler.run(&mut stream).await }
        });

        frames_tx
            .send(r#"{"requestId": 1, "method": "joinRoom", "params": {"roomName": "r1"}}"#.to_string())
            .unwrap();
        parked_rx.await.unwrap();

        // B is already a member, its join reply is not written yet
        let produce = json!({
            "requestId": 3,
            "method": "transportProduce",
            "params": {
                "kind": "video",
                "rtpParameters": {
                    "codecs": [{"mimeType": "video/H264", "payloadType": 100, "clockRate": 90000}]
                }
            }
        });
        let (_, produced) = data(handler.handle_frame(&a, &produce.to_string()).await);
        assert!(produced["id"].is_string());

        resume_tx.send(()).unwrap();
        drop(frames_tx);
        b.await.unwrap();

        let sent = sent.lock().unwrap();
        let types: Vec<&str> = sent.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["connectionSuccess", "response", "newProducer"]);
        assert_eq!(sent[1]["requestId"], 1);
        assert!(sent[1]["data"]["rtpCapabilities"].is_object());
        assert_eq!(sent[2]["producerId"], produced["id"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_stops_owned_feed() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut stream = ScriptedStream {
            frames,
            sent: Arc::clone(&sent),
        };

        frames_tx
            .send(
                json!({
                    "requestId": 1,
                    "method": "loadRtsp",
                    "params": {"rtspUrl": "rtsp://cam/live/front.stream", "streamName": "other"}
                })
                .to_string(),
            )
            .unwrap();
        drop(frames_tx);

        handler.run(&mut stream).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent[1]["data"], json!({"status": "started", "streamName": "front"}));
        assert!(matches!(
            handler.feed.status(),
            roomcast_livestream::FeedStatus::Exited { .. }
        ));
    }
}
