use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use crm_shared::Module;
use std::sync::Arc;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::services::{ModuleFieldsInput, ModuleInput};
use crate::AppState;

pub fn module_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_modules).post(create_module))
        .route("/:module", get(get_module))
        .route("/:module/fields", put(update_fields))
}

async fn list_modules(State(state): State<Arc<AppState>>, _actor: Actor) -> ApiResult<Json<Vec<Module>>> {
    Ok(Json(state.modules.list_modules().await?))
}

async fn create_module(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<ModuleInput>,
) -> ApiResult<(StatusCode, Json<Module>)> {
    let module = state.modules.create_module(payload, &actor).await?;
    Ok((StatusCode::CREATED, Json(module)))
}

async fn get_module(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
    _actor: Actor,
) -> ApiResult<Json<Module>> {
    Ok(Json(state.modules.get_module(&module).await?))
}

async fn update_fields(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
    actor: Actor,
    Json(payload): Json<ModuleFieldsInput>,
) -> ApiResult<Json<Module>> {
    Ok(Json(state.modules.update_fields(&module, payload, &actor).await?))
}
