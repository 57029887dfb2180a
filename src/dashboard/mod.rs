use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::JobProcessor;

/// Read-only HTTP view over the scheduler: the flattened jobs view and the
/// compute job metrics.
#[derive(Clone)]
pub struct DashboardState {
    pub processor: Arc<JobProcessor>,
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.processor.jobs_view())
}

async fn metrics_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.processor.metrics())
}
