use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};

use dairysync_core::gateway::{GatewayOutcome, GatewayRequest};

use crate::error::ApiResult;
use crate::main_lib::AppState;

async fn execute_request(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GatewayRequest>,
) -> ApiResult<(StatusCode, Json<GatewayOutcome>)> {
    let outcome = state.gateway.execute(request).await?;
    let status = match outcome {
        GatewayOutcome::Queued { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/gateway", post(execute_request))
}
