use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use crm_shared::ApprovalWorkflow;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::approvals::WorkflowInput;
use crate::auth::Actor;
use crate::error::ApiResult;
use crate::services::modules::require_admin;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkflowQuery {
    pub module: String,
}

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/:id", get(get_workflow).put(update_workflow).delete(delete_workflow))
}

/// Workflows of one module in evaluation order
async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WorkflowQuery>,
    _actor: Actor,
) -> ApiResult<Json<Vec<ApprovalWorkflow>>> {
    Ok(Json(state.approvals.list_workflows(&params.module).await?))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<WorkflowInput>,
) -> ApiResult<(StatusCode, Json<ApprovalWorkflow>)> {
    require_admin(&actor)?;
    let workflow = state.approvals.create_workflow(payload, &actor.user_id).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _actor: Actor,
) -> ApiResult<Json<ApprovalWorkflow>> {
    Ok(Json(state.approvals.get_workflow(id).await?))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<WorkflowInput>,
) -> ApiResult<Json<ApprovalWorkflow>> {
    require_admin(&actor)?;
    Ok(Json(state.approvals.update_workflow(id, payload, &actor.user_id).await?))
}

async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<StatusCode> {
    require_admin(&actor)?;
    state.approvals.delete_workflow(id, &actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
