use crate::types::{ProducerId, RoomName};
use thiserror::Error;

/// Failures surfaced to the signaling boundary
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room {room} is unavailable: {reason}")]
    RoomUnavailable { room: RoomName, reason: String },

    #[error("Failed to create WebRTC transport: {0}")]
    TransportCreationFailed(String),

    #[error("Cannot consume producer {producer_id} with the given capabilities")]
    IncompatibleMedia { producer_id: ProducerId },

    #[error("{0} is not owned by this connection")]
    UnknownOwner(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("{phase} timed out")]
    HandshakeTimeout { phase: &'static str },

    #[error("Media engine error: {0}")]
    Engine(String),
}

impl SfuError {
    /// Wrap a media engine failure, keeping its context chain
    #[must_use]
    pub fn engine(err: &anyhow::Error) -> Self {
        Self::Engine(format!("{err:#}"))
    }
}

pub type SfuResult<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_keeps_context() {
        let err = anyhow::anyhow!("port exhausted").context("create transport");
        let sfu = SfuError::engine(&err);
        assert_eq!(
            sfu.to_string(),
            "Media engine error: create transport: port exhausted"
        );
    }

    #[test]
    fn test_timeout_names_phase() {
        let err = SfuError::HandshakeTimeout { phase: "consume" };
        assert_eq!(err.to_string(), "consume timed out");
    }
}
