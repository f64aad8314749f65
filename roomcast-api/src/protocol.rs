//! Signaling wire protocol
//!
//! JSON text frames. Requests carry a client-chosen `requestId` that is echoed
//! in the matching response; notifications are pushed without one.
//!
//! ```text
//! → {"requestId": 7, "method": "joinRoom", "params": {"roomName": "r1"}}
//! ← {"type": "response", "requestId": 7, "data": {"rtpCapabilities": {...}}}
//! ← {"type": "newProducer", "producerId": "..."}
//! ```

use roomcast_sfu::media::{DtlsParameters, RtpCapabilities, RtpParameters};
use roomcast_sfu::{
    ConnectionId, ConsumerId, ConsumerInfo, MediaKind, Notification, ProducerId, TransportId,
    TransportInfo,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outer request frame; `params` is decoded once the method is known
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(default)]
    pub request_id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestEnvelope {
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Malformed)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomParams {
    pub room_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransportParams {
    /// true for a receive transport
    #[serde(default)]
    pub consumer: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectParams {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRecvConnectParams {
    pub dtls_parameters: DtlsParameters,
    pub server_consumer_transport_id: TransportId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub rtp_capabilities: RtpCapabilities,
    pub remote_producer_id: ProducerId,
    pub server_consumer_transport_id: TransportId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumeParams {
    pub server_consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerParams {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRtspParams {
    pub rtsp_url: String,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ClientRequest {
    JoinRoom(JoinRoomParams),
    CreateWebRtcTransport(CreateTransportParams),
    TransportConnect(TransportConnectParams),
    TransportRecvConnect(TransportRecvConnectParams),
    TransportProduce(ProduceParams),
    Consume(ConsumeParams),
    ConsumerResume(ConsumerResumeParams),
    GetProducers,
    CloseProducer(CloseProducerParams),
    LoadRtsp(LoadRtspParams),
}

impl ClientRequest {
    pub fn decode(method: &str, params: serde_json::Value) -> Result<Self, ProtocolError> {
        fn params_of<T: DeserializeOwned>(
            method: &str,
            params: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            // Clients may omit params entirely for parameterless methods
            let params = if params.is_null() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                params
            };
            serde_json::from_value(params).map_err(|source| ProtocolError::InvalidParams {
                method: method.to_string(),
                source,
            })
        }

        Ok(match method {
            "joinRoom" => Self::JoinRoom(params_of(method, params)?),
            "createWebRtcTransport" => Self::CreateWebRtcTransport(params_of(method, params)?),
            "transportConnect" => Self::TransportConnect(params_of(method, params)?),
            "transportRecvConnect" => Self::TransportRecvConnect(params_of(method, params)?),
            "transportProduce" => Self::TransportProduce(params_of(method, params)?),
            "consume" => Self::Consume(params_of(method, params)?),
            "consumerResume" => Self::ConsumerResume(params_of(method, params)?),
            "getProducers" => Self::GetProducers,
            "closeProducer" => Self::CloseProducer(params_of(method, params)?),
            "loadRtsp" => Self::LoadRtsp(params_of(method, params)?),
            other => return Err(ProtocolError::UnknownMethod(other.to_string())),
        })
    }

    /// `consumerResume` is fire-and-forget on the wire
    #[must_use]
    pub const fn expects_response(&self) -> bool {
        !matches!(self, Self::ConsumerResume(_))
    }

    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "joinRoom",
            Self::CreateWebRtcTransport(_) => "createWebRtcTransport",
            Self::TransportConnect(_) => "transportConnect",
            Self::TransportRecvConnect(_) => "transportRecvConnect",
            Self::TransportProduce(_) => "transportProduce",
            Self::Consume(_) => "consume",
            Self::ConsumerResume(_) => "consumerResume",
            Self::GetProducers => "getProducers",
            Self::CloseProducer(_) => "closeProducer",
            Self::LoadRtsp(_) => "loadRtsp",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportResponse {
    pub params: TransportInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub id: ProducerId,
    pub producers_exist: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeResponse {
    pub params: ConsumerInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRtspResponse {
    pub status: &'static str,
    pub stream_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Everything the server writes to a connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: Option<u64>,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { socket_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    NewProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { remote_producer_id: ProducerId },
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, message: impl Into<String>) -> Self {
        Self::Response {
            request_id,
            data: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::ConnectionAck { connection_id } => Self::ConnectionSuccess {
                socket_id: connection_id,
            },
            Notification::NewProducer { producer_id, .. } => Self::NewProducer { producer_id },
            Notification::ProducerClosed { producer_id } => Self::ProducerClosed {
                remote_producer_id: producer_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_room() {
        let envelope = RequestEnvelope::parse(
            r#"{"requestId": 3, "method": "joinRoom", "params": {"roomName": "r1", "displayName": "ann"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.request_id, Some(3));

        match ClientRequest::decode(&envelope.method, envelope.params).unwrap() {
            ClientRequest::JoinRoom(params) => {
                assert_eq!(params.room_name, "r1");
                assert_eq!(params.display_name.as_deref(), Some("ann"));
                assert!(!params.is_admin);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_get_producers_without_params() {
        let envelope = RequestEnvelope::parse(r#"{"requestId": 1, "method": "getProducers"}"#).unwrap();
        let request = ClientRequest::decode(&envelope.method, envelope.params).unwrap();
        assert!(matches!(request, ClientRequest::GetProducers));
        assert!(request.expects_response());
    }

    #[test]
    fn test_consumer_resume_is_silent() {
        let request = ClientRequest::decode(
            "consumerResume",
            json!({"serverConsumerId": "c-1"}),
        )
        .unwrap();
        assert!(!request.expects_response());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            RequestEnvelope::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientRequest::decode("restartIce", json!({})),
            Err(ProtocolError::UnknownMethod(m)) if m == "restartIce"
        ));
        assert!(matches!(
            ClientRequest::decode("transportProduce", json!({"kind": "text"})),
            Err(ProtocolError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_server_message_shapes() {
        let ack = ServerMessage::from(Notification::ConnectionAck {
            connection_id: ConnectionId::from("abc"),
        });
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "connectionSuccess", "socketId": "abc"})
        );

        let closed = ServerMessage::from(Notification::ProducerClosed {
            producer_id: ProducerId::from("p1"),
        });
        assert_eq!(
            serde_json::to_value(&closed).unwrap(),
            json!({"type": "producerClosed", "remoteProducerId": "p1"})
        );

        let error = ServerMessage::error(None, "bad frame");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "response", "requestId": null, "data": {"error": "bad frame"}})
        );

        let produced = ServerMessage::Response {
            request_id: Some(9),
            data: serde_json::to_value(ProduceResponse {
                id: ProducerId::from("p2"),
                producers_exist: true,
            })
            .unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&produced).unwrap(),
            json!({"type": "response", "requestId": 9, "data": {"id": "p2", "producersExist": true}})
        );
    }
}
