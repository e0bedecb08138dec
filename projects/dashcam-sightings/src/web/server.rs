use crate::pipeline::scanner::{ConfiguredBackend, ScanBackend};
use crate::pipeline::types::PipelineConfig;
use crate::web::api::{batch_events, cancel_batch, create_batch, get_batch};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared by every handler
pub struct AppState {
    pub config: PipelineConfig,
    pub backend: Arc<dyn ScanBackend>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/batches", post(create_batch))
        .route("/api/batches/:id", get(get_batch))
        .route("/api/batches/:id/events", get(batch_events))
        .route("/api/batches/:id/cancel", post(cancel_batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, config: PipelineConfig) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires non-blocking std listeners
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let state = Arc::new(AppState {
        backend: Arc::new(ConfiguredBackend::new(config.clone())),
        config,
    });

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Dashcam sightings server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, router(state)).await?;

    Ok(())
}
