//! HTTP surface consumed by the back-office UI.

mod entities;
mod gateway;
mod sync;

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::main_lib::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .merge(entities::router())
        .merge(sync::router())
        .merge(gateway::router());

    Router::new().nest("/api/v1", api).with_state(state)
}
