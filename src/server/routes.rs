use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::daemon::events::DaemonEvent;
use crate::errors::DaemonError;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> impl IntoResponse {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /executions
///
/// Creates the execution record and its (empty) log, then immediately
/// schedules it. Pipeline failures are never visible here; the response
/// only reflects whether the record was durably created.
pub async fn create_execution(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let execution = match state.store.create_execution().await {
        Ok(execution) => execution,
        Err(e) => {
            tracing::error!("Failed to create execution: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                &format!("Failed to create execution: {}", e),
            )
            .into_response();
        }
    };

    if let Err(e) = state.log_store.create_log(execution.id).await {
        tracing::error!("Failed to create log for execution {}: {}", execution.id, e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("Failed to create execution log: {}", e),
        )
        .into_response();
    }

    if let Err(e) = state.store.schedule_execution(execution.id).await {
        tracing::error!("Failed to schedule execution {}: {}", execution.id, e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("Failed to schedule execution: {}", e),
        )
        .into_response();
    }

    (StatusCode::CREATED, Json(json!({ "id": execution.id }))).into_response()
}

/// GET /executions
pub async fn list_executions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_executions().await {
        Ok(executions) => (StatusCode::OK, Json(executions)).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("Failed to list executions: {}", e),
        )
        .into_response(),
    }
}

/// GET /executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_execution(id).await {
        Ok(Some(execution)) => (StatusCode::OK, Json(execution)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("Execution {} not found", id),
        )
        .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("Failed to fetch execution: {}", e),
        )
        .into_response(),
    }
}

/// GET /executions/{id}/logs
///
/// Streams the log: the complete file for a finished execution, a live
/// tail for a running one. Dropping the response body (client
/// disconnect) tears the tail down.
pub async fn get_execution_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.log_store.read_log(id).await {
        Ok(stream) => (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(e) => match e.downcast_ref::<DaemonError>() {
            Some(DaemonError::NotFound(message)) => {
                error_response(StatusCode::NOT_FOUND, "not_found", message).into_response()
            }
            _ => {
                tracing::error!("Failed to read log for execution {}: {}", id, e);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    &format!("Failed to read execution log: {}", e),
                )
                .into_response()
            }
        },
    }
}

/// POST /shutdown
pub async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via API");
    state.bus.publish(DaemonEvent::Shutdown);
    if let Some(tx) = &state.shutdown_tx {
        let _ = tx.send(());
    }
    (
        StatusCode::OK,
        Json(json!({ "message": "Shutdown initiated" })),
    )
}
