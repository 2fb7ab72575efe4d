// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: callback intake, restore trigger and health.
//!
//! | route                                       | method | body                     |
//! |---------------------------------------------|--------|--------------------------|
//! | `/api/callbacks/{resource_kind}/{action}`   | POST   | callback payload         |
//! | `/api/handler/restore`                      | POST   | none                     |
//! | `/health`                                   | GET    | none                     |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::engine::{CallbackDispatchEngine, CallbackEvent};
use crate::error::EngineError;
use crate::model::{ActionKind, RequestId, ResourceKind};
use crate::restore::RestoreCoordinator;

/// Payload field carrying the correlation id.
pub const REQUEST_ID_FIELD: &str = "request_id";

/// Shared state behind every route.
pub struct AppState {
    pub engine: Arc<CallbackDispatchEngine>,
    pub restore: Arc<RestoreCoordinator>,
    started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<CallbackDispatchEngine>, restore: Arc<RestoreCoordinator>) -> Self {
        Self {
            engine,
            restore,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    attached_handlers: usize,
    attached_by_route: BTreeMap<String, usize>,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: code,
            message: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::MalformedPayload { .. } | EngineError::ValidationError { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::ResourceBusy { .. } | EngineError::DuplicateRequest { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.error_code(), self.to_string())
    }
}

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/callbacks/{resource_kind}/{action}", post(callback))
        .route("/api/handler/restore", post(restore))
        .route("/health", get(health))
        .with_state(state)
}

#[instrument(skip(state, payload))]
async fn callback(
    State(state): State<Arc<AppState>>,
    Path((resource_kind, action)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Response {
    let route = match (
        resource_kind.parse::<ResourceKind>(),
        action.parse::<ActionKind>(),
    ) {
        (Ok(kind), Ok(action)) => (kind, action),
        (Err(e), _) | (_, Err(e)) => return e.into_response(),
    };

    let request_id = match payload.get(REQUEST_ID_FIELD).and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => RequestId::from(id),
        _ => {
            warn!("Callback without request id");
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_REQUEST_ID",
                format!("'{}' is required", REQUEST_ID_FIELD),
            );
        }
    };

    let event = CallbackEvent {
        request_id,
        route: Some(route),
        payload,
    };
    match state.engine.handle_callback(event).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            error!(error = %e, "Callback could not be processed");
            e.into_response()
        }
    }
}

async fn restore(State(state): State<Arc<AppState>>) -> Response {
    Json(state.restore.restore().await).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        attached_handlers: state.engine.subscriptions().len(),
        attached_by_route: state.engine.subscriptions().by_callback_uri(),
    })
}

/// Serve the router on an already bound listener until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Callback HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("Callback HTTP server stopped");
    Ok(())
}
