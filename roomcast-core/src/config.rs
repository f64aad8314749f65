use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: RoutingConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding the browser client bundle served under `/broadcast/{room}`
    pub public_dir: String,
    /// Maximum inbound signaling frame size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_dir: "./public".to_string(),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Codec advertised by every room's routing context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// "audio" or "video"
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Dynamic RTP payload types 100..=127 available to a router
pub const MAX_MEDIA_CODECS: usize = 28;

/// Media routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Local address transports listen on
    pub listen_ip: String,
    /// Address announced in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<CodecConfig>,
    /// Initial outgoing bitrate hint for new transports (bps)
    pub initial_available_outgoing_bitrate: u32,
    /// Upper bound on each signaling handshake phase
    pub handshake_timeout_seconds: u64,
    /// Maximum concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum members per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Close a room's routing context once its last member leaves
    pub close_empty_rooms: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut h264_parameters = BTreeMap::new();
        h264_parameters.insert(
            "x-google-start-bitrate".to_string(),
            serde_json::Value::from(1000),
        );

        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 30000,
            rtc_max_port: 31000,
            media_codecs: vec![
                CodecConfig {
                    kind: "audio".to_string(),
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: BTreeMap::new(),
                },
                CodecConfig {
                    kind: "video".to_string(),
                    mime_type: "video/H264".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: h264_parameters,
                },
            ],
            initial_available_outgoing_bitrate: 1_000_000,
            handshake_timeout_seconds: 10,
            max_rooms: 0,
            max_peers_per_room: 0,
            close_empty_rooms: true,
        }
    }
}

/// What happens when a feed is requested while another one is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSlotPolicy {
    /// Terminate the running process, then start the new one
    #[default]
    Replace,
    /// Refuse the new request while a process is running
    Reject,
}

/// External feed ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Converter executable
    pub program: String,
    /// Whitespace-separated argument template; `{source_url}` and `{output_dir}` are substituted
    pub pipeline: String,
    /// Root directory holding one sub-directory per stream
    pub files_dir: String,
    /// Time allowed between the graceful signal and a forced kill
    pub terminate_grace_seconds: u64,
    pub policy: FeedSlotPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            pipeline: "rtspsrc location={source_url} protocols=tcp is-live=true ! rtph264depay ! avdec_h264 \
                       ! x264enc speed-preset=ultrafast tune=zerolatency byte-stream=true bitrate=3000 threads=1 \
                       ! mpegtsmux ! hlssink max-files=10 playlist-location={output_dir}/playlist.m3u8 \
                       location={output_dir}/segment%05d.ts target-duration=10"
                .to_string(),
            files_dir: "./files".to_string(),
            terminate_grace_seconds: 5,
            policy: FeedSlotPolicy::Replace,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST_SERVER__PORT, ROOMCAST_SFU__LISTEN_IP, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check the configuration for inconsistencies, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }

        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        let sfu = &self.sfu;
        if sfu.rtc_min_port > sfu.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) exceeds sfu.rtc_max_port ({})",
                sfu.rtc_min_port, sfu.rtc_max_port
            ));
        }
        if sfu.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must list at least one codec".to_string());
        }
        if sfu.media_codecs.len() > MAX_MEDIA_CODECS {
            errors.push(format!(
                "sfu.media_codecs lists {} codecs, at most {MAX_MEDIA_CODECS} fit the dynamic payload range",
                sfu.media_codecs.len()
            ));
        }
        for codec in &sfu.media_codecs {
            if !matches!(codec.kind.as_str(), "audio" | "video") {
                errors.push(format!(
                    "sfu.media_codecs: unknown kind \"{}\" for {}",
                    codec.kind, codec.mime_type
                ));
            }
            if !codec.mime_type.to_lowercase().starts_with(&format!("{}/", codec.kind)) {
                errors.push(format!(
                    "sfu.media_codecs: mime type {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if sfu.handshake_timeout_seconds == 0 {
            errors.push("sfu.handshake_timeout_seconds must be non-zero".to_string());
        }

        if self.feed.program.trim().is_empty() {
            errors.push("feed.program must not be empty".to_string());
        }
        for placeholder in ["{source_url}", "{output_dir}"] {
            if !self.feed.pipeline.contains(placeholder) {
                errors.push(format!("feed.pipeline must contain {placeholder}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sfu.media_codecs.len(), 2);
        assert!(config.sfu.close_empty_rooms);
        assert_eq!(config.feed.policy, FeedSlotPolicy::Replace);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8443,
                ..ServerConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:8443");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.sfu.rtc_min_port = 40000;
        config.sfu.rtc_max_port = 30000;
        config.sfu.media_codecs.clear();
        config.logging.format = "xml".to_string();
        config.feed.pipeline = "hlssink".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.contains("rtc_min_port")));
        assert!(errors.iter().any(|e| e.contains("{source_url}")));
    }

    #[test]
    fn test_validate_rejects_mismatched_codec_kind() {
        let mut config = Config::default();
        config.sfu.media_codecs[0].kind = "video".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("audio/opus"));
    }

    #[test]
    fn test_validate_rejects_too_many_codecs() {
        let mut config = Config::default();
        let opus = config.sfu.media_codecs[0].clone();
        config.sfu.media_codecs = vec![opus; MAX_MEDIA_CODECS + 1];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("29 codecs"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "server:\n  port: 4443\nsfu:\n  max_rooms: 7\nfeed:\n  policy: reject\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 4443);
        assert_eq!(config.sfu.max_rooms, 7);
        assert_eq!(config.feed.policy, FeedSlotPolicy::Reject);
        // Untouched sections keep their defaults
        assert_eq!(config.logging.level, "info");
    }
}
