//! Entity store endpoints: query, read and sync-aware writes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use dairysync_core::entities::{EntityTable, FieldBag, FieldFilter, RecordQuery, SyncableRecord};
use dairysync_core::sync::RecordDelta;

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

/// Center id that lifts the tenant filter on list queries.
const ALL_CENTERS: &str = "*";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    center_id: Option<String>,
    order_by: Option<String>,
    #[serde(default)]
    desc: bool,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    include_deleted: bool,
    /// JSON array of `{ field, op, value }` terms.
    filter: Option<String>,
}

impl ListParams {
    fn into_query(self, default_center: &str) -> ApiResult<RecordQuery> {
        let filters: Vec<FieldFilter> = match self.filter.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| ApiError::BadRequest(format!("Invalid filter: {}", e)))?,
            _ => Vec::new(),
        };
        let center_id = match self.center_id {
            Some(center) if center == ALL_CENTERS => None,
            Some(center) => Some(center),
            None => Some(default_center.to_string()),
        };

        let mut query = RecordQuery {
            center_id,
            filters,
            limit: self.limit,
            offset: self.offset,
            include_deleted: self.include_deleted,
            ..RecordQuery::default()
        };
        if let Some(field) = self.order_by {
            query = query.order_by(field, self.desc);
        }
        Ok(query)
    }
}

fn parse_table(table: &str) -> ApiResult<EntityTable> {
    Ok(table.parse::<EntityTable>()?)
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<SyncableRecord>>> {
    let table = parse_table(&table)?;
    let query = params.into_query(state.entities.center_id())?;
    Ok(Json(state.entities.query(table, &query)?))
}

async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(fields): Json<FieldBag>,
) -> ApiResult<(StatusCode, Json<SyncableRecord>)> {
    let table = parse_table(&table)?;
    let record = state.entities.create_with_sync(table, fields).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<Json<SyncableRecord>> {
    let table = parse_table(&table)?;
    state
        .entities
        .get_by_id(table, &id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} '{}' does not exist", table, id)))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
    Json(partial): Json<FieldBag>,
) -> ApiResult<StatusCode> {
    let table = parse_table(&table)?;
    state
        .entities
        .update_with_sync(table, &id, RecordDelta::from_partial(partial))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let table = parse_table(&table)?;
    state.entities.delete_with_sync(table, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/entities/{table}",
            get(list_records).post(create_record),
        )
        .route(
            "/entities/{table}/{id}",
            get(get_record).patch(update_record).delete(delete_record),
        )
}
