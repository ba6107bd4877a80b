//! JSON API over the running monitor.

mod handlers;

pub use handlers::*;

use crate::config::MonitorConfig;
use crate::endpoint::EndpointSet;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: MonitorConfig,
    pub endpoints: Arc<EndpointSet>,
    pub scheduler: Arc<Scheduler>,
}

/// Web server for reachwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: MonitorConfig, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                endpoints: Arc::clone(scheduler.endpoints()),
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(state: AppState) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/endpoints", get(handlers::handle_get_endpoints).post(handlers::handle_import_endpoints))
            .route("/api/endpoints/pause", post(handlers::handle_pause_all))
            .route("/api/endpoints/resume", post(handlers::handle_resume_all))
            .route(
                "/api/endpoints/{id}",
                get(handlers::handle_get_endpoint)
                    .patch(handlers::handle_update_endpoint)
                    .delete(handlers::handle_delete_endpoint),
            )
            .route("/api/endpoints/{id}/pause", post(handlers::handle_pause_endpoint))
            .route("/api/endpoints/{id}/resume", post(handlers::handle_resume_endpoint))
            .route("/api/endpoints/{id}/replies", get(handlers::handle_get_replies).delete(handlers::handle_clear_replies))
            .route("/api/endpoints/{id}/csv", get(handlers::handle_export_csv))
            .route("/api/endpoints/{id}/json", get(handlers::handle_export_json))
            .route("/api/export", get(handlers::handle_export_definitions))
            .route("/api/totals", get(handlers::handle_get_totals))
            .route("/api/health", get(handlers::handle_health))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(state)
    }

    /// Serve on the configured port until `shutdown` fires.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = Self::routes(self.state.clone());

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

