//! Sync engine status, manual passes, connectivity override and dead-letter review.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use dairysync_core::sync::{
    ConnectivityState, SyncPassResult, SyncPassTrigger, SyncQueueEntry, SyncStatusReport,
};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStatusResponse {
    #[serde(flatten)]
    report: SyncStatusReport,
    connectivity_changed_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ConnectivityRequest {
    online: bool,
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<SyncStatusResponse>> {
    Ok(Json(SyncStatusResponse {
        report: state.engine.status()?,
        connectivity_changed_at: state.connectivity.state().changed_at,
    }))
}

async fn run_sync(State(state): State<Arc<AppState>>) -> ApiResult<Json<SyncPassResult>> {
    let result = state.engine.request_sync(SyncPassTrigger::Manual).await?;
    Ok(Json(result))
}

async fn set_connectivity(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectivityRequest>,
) -> Json<ConnectivityState> {
    if state.connectivity.set_online(body.online) {
        info!(
            "Connectivity manually set {}",
            if body.online { "online" } else { "offline" }
        );
    }
    Json(state.connectivity.state())
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SyncQueueEntry>>> {
    Ok(Json(state.queue.list_dead()?))
}

async fn requeue_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.queue.requeue_dead(id.clone()).await? {
        info!("Dead-letter entry {} requeued", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(dead_letter_not_found(&id))
    }
}

async fn discard_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.queue.discard_dead(id.clone()).await? {
        info!("Dead-letter entry {} discarded", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(dead_letter_not_found(&id))
    }
}

fn dead_letter_not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("No dead-letter entry '{}'", id))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/status", get(get_status))
        .route("/sync/run", post(run_sync))
        .route("/sync/connectivity", put(set_connectivity))
        .route("/sync/dead-letters", get(list_dead_letters))
        .route("/sync/dead-letters/{id}", delete(discard_dead_letter))
        .route("/sync/dead-letters/{id}/requeue", post(requeue_dead_letter))
}
