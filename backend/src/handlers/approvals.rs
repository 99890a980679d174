use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::services::RecordDocument;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalDecision {
    #[serde(default)]
    pub comment: Option<String>,
}

pub fn approval_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/approve", post(approve_record))
        .route("/:id/reject", post(reject_record))
        .route("/:id/can-approve", get(can_approve))
}

async fn approve_record(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
    payload: Option<Json<ApprovalDecision>>,
) -> ApiResult<Json<RecordDocument>> {
    let comment = payload.and_then(|Json(d)| d.comment).unwrap_or_default();
    state.approvals.approve_record(&module, id, &actor, &comment).await?;
    Ok(Json(state.records.get_record(&module, id, &actor).await?))
}

async fn reject_record(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
    payload: Option<Json<ApprovalDecision>>,
) -> ApiResult<Json<RecordDocument>> {
    let comment = payload.and_then(|Json(d)| d.comment).unwrap_or_default();
    state.approvals.reject_record(&module, id, &actor, &comment).await?;
    Ok(Json(state.records.get_record(&module, id, &actor).await?))
}

async fn can_approve(
    State(state): State<Arc<AppState>>,
    Path((module, id)): Path<(String, Uuid)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    let allowed = state.approvals.can_approve(&module, id, &actor).await?;
    Ok(Json(json!({ "can_approve": allowed })))
}
