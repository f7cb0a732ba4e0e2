pub mod health;
pub mod routes;
pub mod subscribe;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::daemon::events::EventBus;
use crate::models::DaemonConfig;
use crate::storage::{ExecutionStore, LogStore};

/// Shared application state for the Axum server.
pub struct AppState {
    pub store: Arc<dyn ExecutionStore>,
    pub log_store: Arc<dyn LogStore>,
    pub bus: EventBus,
    pub config: Arc<DaemonConfig>,
    pub start_time: Instant,
    pub shutdown_tx: Option<tokio::sync::watch::Sender<()>>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/executions",
            get(routes::list_executions).post(routes::create_execution),
        )
        .route(
            "/executions/subscribe",
            post(subscribe::subscribe_executions),
        )
        .route("/executions/{id}", get(routes::get_execution))
        .route("/executions/{id}/logs", get(routes::get_execution_log))
        .route("/shutdown", post(routes::shutdown))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
