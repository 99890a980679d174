use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use crm_shared::AuditLog;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::pagination::{split_record_query, PaginatedResponse};
use crate::services::RecordDocument;
use crate::validation::RawFields;
use crate::AppState;

pub fn record_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_records).post(create_record))
        .route(
            "/:id",
            get(get_record)
                .put(update_record)
                .patch(update_record)
                .delete(delete_record),
        )
        .route("/:id/history", get(record_history))
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    actor: Actor,
) -> ApiResult<Json<PaginatedResponse<RecordDocument>>> {
    let (params, filter) = split_record_query(query);
    let page = state
        .records
        .list_records(&module, &filter, params.to_list_query(), &actor)
        .await?;
    Ok(Json(PaginatedResponse::new(page.records, &params, page.total)))
}

async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
    actor: Actor,
    Json(payload): Json<RawFields>,
) -> ApiResult<(StatusCode, Json<RecordDocument>)> {
    let record = state.records.create_record(&module, &payload, &actor).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
) -> ApiResult<Json<RecordDocument>> {
    Ok(Json(state.records.get_record(&module, id, &actor).await?))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
    Json(payload): Json<RawFields>,
) -> ApiResult<Json<RecordDocument>> {
    Ok(Json(state.records.update_record(&module, id, &payload, &actor).await?))
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
) -> ApiResult<StatusCode> {
    state.records.delete_record(&module, id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn record_history(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
) -> ApiResult<Json<Vec<AuditLog>>> {
    // Same visibility as the record itself
    state.records.get_record(&module, id, &actor).await?;
    Ok(Json(state.audit.record_history(&module, id).await?))
}
