//! Translate the loaded configuration into component settings

use std::path::PathBuf;
use std::time::Duration;

use roomcast_core::config::{CodecConfig, FeedConfig, FeedSlotPolicy, RoutingConfig};
use roomcast_livestream::{FeedBridgeConfig, SlotPolicy};
use roomcast_sfu::media::RtpCodecCapability;
use roomcast_sfu::{MediaKind, SfuConfig, WebRtcTransportOptions};

pub fn sfu_config(routing: &RoutingConfig) -> anyhow::Result<SfuConfig> {
    let media_codecs = routing
        .media_codecs
        .iter()
        .map(codec_capability)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(SfuConfig {
        media_codecs,
        transport: WebRtcTransportOptions {
            listen_ip: routing.listen_ip.clone(),
            announced_ip: routing.announced_ip.clone(),
            initial_available_outgoing_bitrate: routing.initial_available_outgoing_bitrate,
            ..WebRtcTransportOptions::default()
        },
        handshake_timeout: Duration::from_secs(routing.handshake_timeout_seconds),
        max_rooms: routing.max_rooms,
        max_peers_per_room: routing.max_peers_per_room,
        close_empty_rooms: routing.close_empty_rooms,
    })
}

fn codec_capability(codec: &CodecConfig) -> anyhow::Result<RtpCodecCapability> {
    let kind: MediaKind = codec.kind.parse().map_err(|e| {
        anyhow::anyhow!("codec {} has invalid kind '{}': {e}", codec.mime_type, codec.kind)
    })?;

    Ok(RtpCodecCapability {
        kind,
        mime_type: codec.mime_type.clone(),
        preferred_payload_type: None,
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        parameters: codec.parameters.clone(),
        rtcp_feedback: Vec::new(),
    })
}

pub fn feed_config(feed: &FeedConfig) -> FeedBridgeConfig {
    FeedBridgeConfig {
        program: feed.program.clone(),
        pipeline: feed.pipeline.clone(),
        files_dir: PathBuf::from(&feed.files_dir),
        terminate_grace: Duration::from_secs(feed.terminate_grace_seconds),
        policy: match feed.policy {
            FeedSlotPolicy::Replace => SlotPolicy::Replace,
            FeedSlotPolicy::Reject => SlotPolicy::Reject,
        },
    }
}
