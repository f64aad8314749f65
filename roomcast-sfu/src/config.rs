//! SFU Configuration

use crate::media::{MediaKind, RtpCodecCapability};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Options applied to every transport a router creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcTransportOptions {
    /// Local address the transport binds to
    pub listen_ip: String,
    /// Address advertised to clients (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Initial outgoing bitrate estimate (bps)
    pub initial_available_outgoing_bitrate: u32,
}

impl WebRtcTransportOptions {
    /// Address clients should connect to
    #[must_use]
    pub fn public_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

/// SFU configuration
#[derive(Debug, Clone)]
pub struct SfuConfig {
    /// Codecs every room's router supports
    pub media_codecs: Vec<RtpCodecCapability>,
    pub transport: WebRtcTransportOptions,
    /// Upper bound on each engine call made while handling a request
    pub handshake_timeout: Duration,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum members per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Close a room's router once its last member leaves
    pub close_empty_rooms: bool,
}

/// Opus 48 kHz stereo and H264 90 kHz
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_parameters = BTreeMap::new();
    h264_parameters.insert(
        "x-google-start-bitrate".to_string(),
        serde_json::Value::from(1000),
    );

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters,
            rtcp_feedback: Vec::new(),
        },
    ]
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
            transport: WebRtcTransportOptions::default(),
            handshake_timeout: Duration::from_secs(10),
            max_rooms: 0,
            max_peers_per_room: 0,
            close_empty_rooms: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_ip_prefers_announced_address() {
        let mut options = WebRtcTransportOptions::default();
        assert_eq!(options.public_ip(), "127.0.0.1");

        options.announced_ip = Some("203.0.113.7".to_string());
        assert_eq!(options.public_ip(), "203.0.113.7");
    }

    #[test]
    fn test_default_codecs() {
        let config = SfuConfig::default();
        assert_eq!(config.media_codecs.len(), 2);
        assert_eq!(config.media_codecs[0].kind, MediaKind::Audio);
        assert_eq!(
            config.media_codecs[1].parameters["x-google-start-bitrate"],
            serde_json::json!(1000)
        );
    }
}
