//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket server and, on shutdown:
//! - stops accepting connections
//! - terminates the feed converter
//! - tears down every signaling session and room

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use roomcast_api::{create_router, AppState};
use roomcast_core::Config;
use roomcast_livestream::FeedBridge;
use roomcast_sfu::SfuManager;

/// How long open connections get to finish after shutdown begins
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Roomcast server - owns the long-lived components
pub struct RoomcastServer {
    config: Config,
    manager: Arc<SfuManager>,
    feed: Arc<FeedBridge>,
}

impl RoomcastServer {
    pub const fn new(config: Config, manager: Arc<SfuManager>, feed: Arc<FeedBridge>) -> Self {
        Self {
            config,
            manager,
            feed,
        }
    }

    /// Serve until a shutdown signal arrives or the HTTP server stops
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown().await;

        if !http_handle.is_finished() {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut http_handle).await {
                Ok(_) => info!("All connections drained"),
                Err(_) => {
                    warn!(
                        timeout = ?DRAIN_TIMEOUT,
                        "Drain timeout reached, closing remaining connections"
                    );
                    http_handle.abort();
                }
            }
        }

        info!("Roomcast server stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down roomcast server...");
        self.feed.shutdown().await;
        self.manager.shutdown().await;
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        let state = AppState::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.feed),
            &self.config.server.public_dir,
            self.config.server.max_message_size,
        );
        let router = create_router(state);

        info!(address = %http_addr, "HTTP server listening");

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "HTTP server error");
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
