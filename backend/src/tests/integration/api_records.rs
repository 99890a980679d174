use axum::http::{Method, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use crate::tests::fixtures::{install_modules, lead};
use crate::tests::helpers::{admin, json_request, read_json, user};
use crate::tests::TestContext;

async fn setup() -> TestContext {
    let ctx = TestContext::new().await;
    install_modules(&ctx).await;
    ctx
}

#[tokio::test]
async fn test_requests_without_identity_are_rejected() {
    let ctx = setup().await;

    let response = ctx
        .router()
        .oneshot(json_request(Method::GET, "/api/v1/modules/leads/records", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response).await["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_health_reports_outbox_backlog() {
    let ctx = setup().await;
    ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();

    let response = ctx
        .router()
        .oneshot(json_request(Method::GET, "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["outbox_pending"], 2);
}

#[tokio::test]
async fn test_record_lifecycle_over_http() {
    let ctx = setup().await;
    let rep = user("rep-1", &["sales"]);

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/modules/leads/records",
            Some(&rep),
            Some(json!({ "name": "Acme", "stage": "new" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    let id = created["_id"].as_str().unwrap().to_string();
    assert_eq!(created["owner"], "rep-1");

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::PATCH,
            &format!("/api/v1/modules/leads/records/{}", id),
            Some(&rep),
            Some(json!({ "stage": "qualified" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["stage"], "qualified");

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::GET,
            &format!("/api/v1/modules/leads/records/{}/history", id),
            Some(&rep),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history = read_json(response).await;
    let actions: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|h| h["action"].as_str())
        .collect();
    assert!(actions.contains(&"create"));
    assert!(actions.contains(&"update"));

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::DELETE,
            &format!("/api/v1/modules/leads/records/{}", id),
            Some(&rep),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::GET,
            &format!("/api/v1/modules/leads/records/{}", id),
            Some(&rep),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_validation_errors_list_fields() {
    let ctx = setup().await;

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/modules/expenses/records",
            Some(&admin()),
            Some(json!({ "amount": "twelve", "category": "food" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = read_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    let mut fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["field"].as_str())
        .collect();
    fields.sort();
    assert_eq!(fields, vec!["amount", "category", "title"]);
}

#[tokio::test]
async fn test_list_pages_and_filters() {
    let ctx = setup().await;
    for stage in ["new", "won", "new", "new"] {
        ctx.state.records.create_record("leads", &lead(stage), &admin()).await.unwrap();
    }

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::GET,
            "/api/v1/modules/leads/records?stage=new&per_page=2&page=1&sort_by=name&sort_order=asc",
            Some(&admin()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = read_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["meta"]["total"], 3);
    assert_eq!(body["meta"]["total_pages"], 2);
    assert_eq!(body["meta"]["has_next"], true);

    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn test_hidden_field_filter_is_forbidden() {
    let ctx = setup().await;

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::GET,
            "/api/v1/modules/leads/records?margin=0.5",
            Some(&user("rep-1", &["sales"])),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_module_schema_requires_admin() {
    let ctx = setup().await;
    let definition = json!({
        "name": "accounts",
        "label": "Accounts",
        "fields": [
            { "name": "name", "label": "Name", "type": "text", "required": true },
            { "name": "primary_contact", "label": "Primary contact", "type": "lookup", "lookup": { "target_module": "contacts", "display_field": "name" } }
        ]
    });

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/modules",
            Some(&user("rep-1", &["sales"])),
            Some(definition.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/modules", Some(&admin()), Some(definition)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let module = read_json(response).await;
    assert_eq!(module["name"], "accounts");
    assert_eq!(module["is_system"], false);

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::PUT,
            "/api/v1/modules/tasks/fields",
            Some(&admin()),
            Some(json!({ "fields": [] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
