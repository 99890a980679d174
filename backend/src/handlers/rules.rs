use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use crm_shared::AutomationRule;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Actor;
use crate::automation::RuleInput;
use crate::error::ApiResult;
use crate::services::modules::require_admin;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RuleQuery {
    pub module: Option<String>,
}

pub fn rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/:id", get(get_rule).put(update_rule).delete(delete_rule))
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RuleQuery>,
    _actor: Actor,
) -> ApiResult<Json<Vec<AutomationRule>>> {
    Ok(Json(state.automation.list_rules(params.module.as_deref()).await?))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<RuleInput>,
) -> ApiResult<(StatusCode, Json<AutomationRule>)> {
    require_admin(&actor)?;
    let rule = state.automation.create_rule(payload, &actor.user_id).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _actor: Actor,
) -> ApiResult<Json<AutomationRule>> {
    Ok(Json(state.automation.get_rule(id).await?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<RuleInput>,
) -> ApiResult<Json<AutomationRule>> {
    require_admin(&actor)?;
    Ok(Json(state.automation.update_rule(id, payload, &actor.user_id).await?))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<StatusCode> {
    require_admin(&actor)?;
    state.automation.delete_rule(id, &actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
