use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod approvals;
pub mod modules;
pub mod records;
pub mod rules;
pub mod workflows;

pub use approvals::approval_routes;
pub use modules::module_routes;
pub use records::record_routes;
pub use rules::rule_routes;
pub use workflows::workflow_routes;

/// Everything under `/api/v1`
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/modules", module_routes())
        .nest("/modules/:module/records", record_routes().merge(approval_routes()))
        .nest("/rules", rule_routes())
        .nest("/workflows", workflow_routes())
        .route("/jobs", get(job_runs))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    match state.repos.outbox.pending_count().await {
        Ok(pending) => (
            StatusCode::OK,
            Json(json!({"status": "healthy", "service": "crm-api", "outbox_pending": pending})),
        ),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "service": "crm-api"})),
            )
        }
    }
}

async fn job_runs(State(state): State<Arc<AppState>>) -> Json<Vec<crate::jobs::scheduler::JobExecutionLog>> {
    Json(state.job_logs.recent(20).await)
}
