mod server;
mod wiring;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use roomcast_core::{bootstrap::load_config, logging};
use roomcast_livestream::FeedBridge;
use roomcast_sfu::{LocalMediaEngine, SfuManager};

use server::RoomcastServer;

/// Multi-party WebRTC rooms with an RTSP feed bridge
#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about)]
struct Cli {
    /// Path to a YAML/TOML config file
    #[arg(short, long, env = "ROOMCAST_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration (fails fast on every problem found)
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Roomcast server starting...");
    info!(address = %config.http_address(), "HTTP address");

    // 3. Media routing and signaling core
    let sfu_config = wiring::sfu_config(&config.sfu)?;
    let engine = Arc::new(LocalMediaEngine::new(
        config.sfu.rtc_min_port,
        config.sfu.rtc_max_port,
    ));
    let manager = SfuManager::new(sfu_config, engine);
    info!(
        rtc_min_port = config.sfu.rtc_min_port,
        rtc_max_port = config.sfu.rtc_max_port,
        "SFU manager initialized"
    );

    // 4. Feed bridge
    let feed = FeedBridge::new(wiring::feed_config(&config.feed));
    info!(
        program = %config.feed.program,
        files_dir = %config.feed.files_dir,
        policy = ?config.feed.policy,
        "Feed bridge initialized"
    );

    // 5. Serve until shutdown
    RoomcastServer::new(config, manager, feed).start().await
}
