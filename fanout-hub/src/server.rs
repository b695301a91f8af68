use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::PumpConfig,
    hub::{Hub, HubHandle},
    ws::ws_handler,
};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<PumpConfig>,
}

pub struct Server {
    listener: TcpListener,
    config: Arc<PumpConfig>,
    hub: Hub,
    handle: HubHandle,
}

impl Server {
    pub fn new(listener: TcpListener, config: PumpConfig) -> Self {
        let (hub, handle) = Hub::new();
        Self {
            listener,
            config: Arc::new(config),
            hub,
            handle,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to this server's hub. Commands queue up until the server runs.
    pub fn hub(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Serves HTTP until `shutdown` resolves, then closes every client and
    /// waits for the hub to stop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            config,
            hub,
            handle,
        } = self;

        let hub_task = tokio::spawn(hub.run());
        let app = router(AppState {
            hub: handle.clone(),
            config,
        });

        let signal_hub = handle.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("server shutting down");
                let _ = signal_hub.shutdown();
            })
            .await
            .context("http server failed");

        // The hub may already be gone if shutdown came through the signal.
        let _ = handle.shutdown();
        hub_task.await.context("hub task panicked")?;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    broadcasts: u64,
    evictions: u64,
}

/// `GET /healthz`: hub registry size and counters.
async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, StatusCode> {
    let status = state
        .hub
        .status()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(HealthResponse {
        status: "ok",
        clients: status.clients.len(),
        broadcasts: status.broadcasts,
        evictions: status.evictions,
    }))
}
