//! Server lifecycle management
//!
//! Manages the startup and shutdown of:
//! - the WebSocket signaling server
//! - the Prometheus metrics server
//! - the SFU background tasks

use axum::{routing::get, Router};
use minisfu_sfu::Sfu;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics;
use crate::signaling::{websocket_handler, SignalingState};

pub struct MiniSfuServer {
    config: Config,
    sfu: Arc<Sfu>,
}

/// Router serving `/ws`
pub fn signaling_router(sfu: Arc<Sfu>, max_message_size: usize) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(SignalingState {
            sfu,
            max_message_size,
        })
}

impl MiniSfuServer {
    pub const fn new(config: Config, sfu: Arc<Sfu>) -> Self {
        Self { config, sfu }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting minisfu server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = self.sfu.spawn_background_tasks();

        let signaling_addr: SocketAddr = self.config.server.addr.parse()?;
        let signaling_handle = serve(
            "Signaling",
            signaling_addr,
            signaling_router(Arc::clone(&self.sfu), self.config.server.max_message_size),
            shutdown_rx.clone(),
        )
        .await?;

        let metrics_handle = if self.config.server.metrics_addr.is_empty() {
            info!("Metrics server disabled");
            None
        } else {
            metrics::init();
            let metrics_addr: SocketAddr = self.config.server.metrics_addr.parse()?;
            Some(
                serve(
                    "Metrics",
                    metrics_addr,
                    metrics::router(Arc::clone(&self.sfu)),
                    shutdown_rx,
                )
                .await?,
            )
        };

        info!("All servers started successfully");

        tokio::select! {
            _ = signaling_handle => {
                error!("Signaling server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);

        info!("Shutting down SFU...");
        self.sfu.shutdown().await;
        for handle in background {
            let _ = handle.await;
        }
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }

        info!("minisfu server shut down");
        Ok(())
    }
}

/// Bind `addr` and serve `router` until the shutdown flag flips
async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {name} address {addr}: {e}"))?;
    info!("{} server listening on {}", name, addr);

    Ok(tokio::spawn(async move {
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("{} server error: {}", name, e);
        }

        info!("{} server shut down gracefully", name);
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
