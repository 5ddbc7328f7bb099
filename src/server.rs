//! Indexer server: pipeline + HTTP API

use crate::api::{create_router, ApiState};
use crate::common::{Config, Result};
use crate::indexer::Pipeline;
use crate::ledger::Ledger;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

pub struct IndexerServer {
    config: Config,
}

impl IndexerServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C / SIGTERM
    pub async fn serve(self, ledger: Arc<dyn Ledger>) -> Result<()> {
        self.serve_with_shutdown(ledger, shutdown_signal()).await
    }

    pub async fn serve_with_shutdown<F>(self, ledger: Arc<dyn Ledger>, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = &self.config;
        tracing::info!("Starting pixel indexer v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("  HTTP API: {}", config.api.bind_addr);
        tracing::info!("  Ledger RPC: {}", config.ledger.rpc_url);
        tracing::info!(
            "  Ledger WS: {}",
            config.ledger.ws_url.as_deref().unwrap_or("(polling only)")
        );
        tracing::info!("  Snapshot: {}", config.indexer.snapshot_path.display());
        tracing::info!("  Resolution: {}", config.indexer.resolution);

        // bind before any ingestion task is spawned
        let listener = tokio::net::TcpListener::bind(config.api.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let pipeline = Pipeline::start(config, ledger).await?;

        let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
        let router = create_router(ApiState {
            query: pipeline.query(),
            heartbeat_interval: config.api.heartbeat_interval(),
            shutdown: api_shutdown_rx,
        });
        tracing::info!("✓ Indexer ready on {}", local_addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("Shutdown signal received");
                // ends open event streams so connections can drain
                let _ = api_shutdown_tx.send(true);
            })
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        pipeline.shutdown().await;
        served.map_err(Into::into)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
