//! Media engine abstraction
//!
//! The signaling core never touches RTP, ICE or DTLS itself. It drives a
//! [`MediaEngine`] that hands out routers, transports, producers and consumers,
//! and listens to the lifecycle events the engine reports back.

mod local;

pub use local::LocalMediaEngine;

use crate::config::WebRtcTransportOptions;
use crate::media::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle change reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    /// Producer closed by the engine itself (e.g. its transport went away)
    ProducerClosed {
        producer_id: ProducerId,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a routing context supporting the given codecs
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> anyhow::Result<Arc<dyn Router>>;

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Routing context shared by every member of one room
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with `rtp_capabilities` can consume the producer
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> anyhow::Result<Arc<dyn WebRtcTransport>>;

    async fn close(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    fn dtls_state(&self) -> DtlsState;

    /// Apply the remote DTLS parameters; only valid once per transport
    async fn connect(&self, dtls_parameters: DtlsParameters) -> anyhow::Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> anyhow::Result<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> anyhow::Result<Arc<dyn Consumer>>;

    async fn close(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    async fn resume(&self) -> anyhow::Result<()>;

    async fn close(&self);
}
