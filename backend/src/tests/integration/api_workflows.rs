use axum::http::{Method, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use crate::tests::fixtures::{finance_workflow, install_modules, won_lead_rule};
use crate::tests::helpers::{admin, json_request, read_json, user};
use crate::tests::TestContext;

async fn setup() -> TestContext {
    let ctx = TestContext::new().await;
    install_modules(&ctx).await;
    ctx
}

async fn create_expense(ctx: &TestContext, amount: f64) -> String {
    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/modules/expenses/records",
            Some(&user("emp-1", &["staff"])),
            Some(json!({ "title": "Conference trip", "amount": amount, "category": "travel" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    read_json(response).await["_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_workflow_management_requires_admin() {
    let ctx = setup().await;
    let body = serde_json::to_value(finance_workflow()).unwrap();

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/workflows",
            Some(&user("fin-1", &["finance"])),
            Some(body.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/workflows", Some(&admin()), Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/workflows", Some(&admin()), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(read_json(response).await["code"], "CONFIG_CONFLICT");

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::GET,
            "/api/v1/workflows?module=expenses",
            Some(&user("emp-1", &[])),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_approval_endpoints() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    let id = create_expense(&ctx, 4200.0).await;
    let record_uri = format!("/api/v1/modules/expenses/records/{}", id);
    let finance = user("fin-1", &["finance"]);

    let response = ctx
        .router()
        .oneshot(json_request(Method::PUT, &record_uri, Some(&admin()), Some(json!({ "amount": 10 }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert_eq!(read_json(response).await["code"], "RECORD_LOCKED");

    let response = ctx
        .router()
        .oneshot(json_request(Method::GET, &format!("{}/can-approve", record_uri), Some(&finance), None))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["can_approve"], true);

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            &format!("{}/approve", record_uri),
            Some(&user("rep-1", &["sales"])),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            &format!("{}/approve", record_uri),
            Some(&finance),
            Some(json!({ "comment": "approved for Q3" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = read_json(response).await;
    assert_eq!(record["_approval"]["status"], "approved");
    assert_eq!(record["_approval"]["history"][0]["comment"], "approved for Q3");

    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, &format!("{}/reject", record_uri), Some(&finance), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(read_json(response).await["code"], "NOT_PENDING");

    // Approved records are editable again
    let response = ctx
        .router()
        .oneshot(json_request(Method::PUT, &record_uri, Some(&admin()), Some(json!({ "amount": 4000 }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rule_management_over_http() {
    let ctx = setup().await;
    let body = serde_json::to_value(won_lead_rule()).unwrap();

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/rules",
            Some(&user("rep-1", &["sales"])),
            Some(body.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/rules", Some(&admin()), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let rule = read_json(response).await;
    assert_eq!(rule["active"], true);
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let response = ctx
        .router()
        .oneshot(json_request(Method::GET, "/api/v1/rules?module=leads", Some(&admin()), None))
        .await
        .unwrap();
    assert_eq!(read_json(response).await.as_array().unwrap().len(), 1);

    let invalid = json!({
        "module": "leads",
        "name": "Broken",
        "trigger_type": "create",
        "actions": [{ "type": "webhook", "config": {} }]
    });
    let response = ctx
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/rules", Some(&admin()), Some(invalid)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(read_json(response).await["details"][0]["field"], "actions[0].config");

    let response = ctx
        .router()
        .oneshot(json_request(
            Method::DELETE,
            &format!("/api/v1/rules/{}", rule_id),
            Some(&admin()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
