use crm_shared::{
    CreateTaskConfig, DataSyncConfig, FieldValue, Record, RuleAction, RunScriptConfig, SendEmailConfig,
    SendNotificationConfig, UpdateFieldConfig, WebhookConfig,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::automation::{ActionExecutor, RepositoryHost, ScriptSandbox, AUTOMATION_ACTOR};
use crate::services::email::{MailError, Mailer, MockMailer};
use crate::services::sync::{MockSyncService, SyncReport, SyncService};
use crate::services::system_modules::{NOTIFICATIONS, TASKS};
use crate::store::ListQuery;
use crate::tests::fixtures::{install_modules, lead, record_id};
use crate::tests::helpers::admin;
use crate::tests::{test_automation_config, TestContext};
use crate::validation::RecordValidator;

fn executor(ctx: &TestContext, mailer: Arc<dyn Mailer>, sync: Arc<dyn SyncService>) -> ActionExecutor {
    let repos = &ctx.state.repos;
    let host = Arc::new(RepositoryHost::new(
        repos.modules.clone(),
        repos.records.clone(),
        RecordValidator::new(repos.records.clone(), repos.files.clone()),
    ));
    ActionExecutor::new(
        repos,
        mailer,
        sync,
        ScriptSandbox::new(host, test_automation_config().script),
        Duration::from_secs(5),
    )
}

fn idle_executor(ctx: &TestContext) -> ActionExecutor {
    executor(ctx, Arc::new(MockMailer::new()), Arc::new(MockSyncService::new()))
}

async fn stored_lead(ctx: &TestContext) -> Record {
    install_modules(ctx).await;
    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    ctx.state
        .repos
        .records
        .get("leads", record_id(&doc))
        .await
        .unwrap()
        .unwrap()
}

fn update_field(field: &str, value: serde_json::Value) -> RuleAction {
    RuleAction::UpdateField(UpdateFieldConfig {
        field: field.to_string(),
        value,
    })
}

#[tokio::test]
async fn test_failed_action_does_not_stop_the_rest() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;

    let mut mailer = MockMailer::new();
    mailer
        .expect_send_email()
        .times(1)
        .returning(|_, _, _| Err(MailError::Transport("connection refused".to_string())));
    let executor = executor(&ctx, Arc::new(mailer), Arc::new(MockSyncService::new()));

    let actions = vec![
        update_field("status", json!("closed")),
        RuleAction::SendEmail(SendEmailConfig {
            to: "owner@example.com".to_string(),
            subject: Some("Lead {{name}}".to_string()),
            body: Some("Stage is {{stage}}".to_string()),
            ..Default::default()
        }),
        RuleAction::CreateTask(CreateTaskConfig {
            subject: "Call {{name}}".to_string(),
            ..Default::default()
        }),
    ];
    let results = executor.execute_actions(&actions, "leads", &lead).await;

    let outcome: Vec<bool> = results.iter().map(|r| r.success).collect();
    assert_eq!(outcome, vec![true, false, true]);
    assert!(results[1].error.as_deref().unwrap().contains("connection refused"));

    let stored = ctx.state.repos.records.get("leads", lead.id).await.unwrap().unwrap();
    assert_eq!(stored.data.get("status"), Some(&FieldValue::Text("closed".to_string())));

    let (tasks, total) = ctx.state.repos.records.list(TASKS, &ListQuery::default()).await.unwrap();
    assert_eq!(total, 1);
    let expected = format!("Call {}", lead.data["name"].display_string());
    assert_eq!(tasks[0].data.get("subject").and_then(FieldValue::as_str), Some(expected.as_str()));
    assert_eq!(tasks[0].created_by, AUTOMATION_ACTOR);
}

#[tokio::test]
async fn test_email_renders_placeholders() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let name = lead.data["name"].display_string();

    let mut mailer = MockMailer::new();
    let expected_subject = format!("New lead {}", name);
    mailer
        .expect_send_email()
        .withf(move |to, subject, body| {
            to == "sales@example.com" && subject == expected_subject && body == "Stage: new"
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    let executor = executor(&ctx, Arc::new(mailer), Arc::new(MockSyncService::new()));

    let action = RuleAction::SendEmail(SendEmailConfig {
        to: "sales@example.com".to_string(),
        subject: Some("New lead {{name}}".to_string()),
        body: Some("Stage: {{stage}}".to_string()),
        ..Default::default()
    });
    let result = executor.execute_action(&action, "leads", &lead).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.unwrap()["sent_to"], "sales@example.com");
}

#[tokio::test]
async fn test_update_field_converts_by_schema() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let executor = idle_executor(&ctx);

    let typed = executor.execute_action(&update_field("margin", json!("0.25")), "leads", &lead).await;
    assert!(typed.success);
    let untyped = executor.execute_action(&update_field("nickname", json!(7)), "leads", &lead).await;
    assert!(untyped.success);

    let stored = ctx.state.repos.records.get("leads", lead.id).await.unwrap().unwrap();
    assert_eq!(stored.data.get("margin"), Some(&FieldValue::Number(0.25)));
    assert_eq!(stored.data.get("nickname"), Some(&FieldValue::Number(7.0)));
    // Automation writes do not queue further events
    assert_eq!(ctx.store.outbox_events().await.len(), 2);
}

#[tokio::test]
async fn test_missing_config_fails_without_side_effects() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let executor = idle_executor(&ctx);

    let result = executor
        .execute_action(&RuleAction::Webhook(WebhookConfig::default()), "leads", &lead)
        .await;
    assert!(!result.success);
    assert_eq!(result.action_type, "webhook");
    assert!(result.error.unwrap().contains("url"));
}

#[tokio::test]
async fn test_webhook_action_posts_record() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let executor = idle_executor(&ctx);

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/lead"))
        .and(header("x-source", "crm"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut headers = BTreeMap::new();
    headers.insert("x-source".to_string(), "crm".to_string());
    let ok = RuleAction::Webhook(WebhookConfig {
        url: format!("{}/hooks/lead", server.uri()),
        method: None,
        headers,
    });
    let result = executor.execute_action(&ok, "leads", &lead).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.unwrap()["status_code"], 202);

    let broken = RuleAction::Webhook(WebhookConfig {
        url: format!("{}/hooks/broken", server.uri()),
        ..Default::default()
    });
    let result = executor.execute_action(&broken, "leads", &lead).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("500"));

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["module"], "leads");
    assert_eq!(body["record"]["_id"], lead.id.to_string());
}

#[tokio::test]
async fn test_notification_is_stored() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let executor = idle_executor(&ctx);

    let action = RuleAction::SendNotification(SendNotificationConfig {
        user_id: "{{owner}}".to_string(),
        title: "Lead moved".to_string(),
        message: "Now in {{stage}}".to_string(),
    });
    let result = executor.execute_action(&action, "leads", &lead).await;
    assert!(result.success, "{:?}", result.error);

    let (notes, _) = ctx.state.repos.records.list(NOTIFICATIONS, &ListQuery::default()).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].data.get("user_id").and_then(FieldValue::as_str), Some("admin-1"));
    assert_eq!(notes[0].data.get("message").and_then(FieldValue::as_str), Some("Now in new"));
}

#[tokio::test]
async fn test_data_sync_reports_counts() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;

    let mut sync = MockSyncService::new();
    sync.expect_run_sync()
        .withf(|id| id == "nightly")
        .times(1)
        .returning(|_| Ok(SyncReport { created: 2, updated: 1, skipped: 0 }));
    let executor = executor(&ctx, Arc::new(MockMailer::new()), Arc::new(sync));

    let action = RuleAction::DataSync(DataSyncConfig {
        sync_setting_id: "nightly".to_string(),
    });
    let result = executor.execute_action(&action, "leads", &lead).await;
    assert!(result.success);
    let output = result.output.unwrap();
    assert_eq!(output["created"], 2);
    assert_eq!(output["updated"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_updates_record_through_host() {
    let ctx = TestContext::new().await;
    let lead = stored_lead(&ctx).await;
    let executor = idle_executor(&ctx);

    let action = RuleAction::RunScript(RunScriptConfig {
        script: r#"
            update(module, record_id, { score = 42 })
            return record.stage
        "#
        .to_string(),
    });
    let result = executor.execute_action(&action, "leads", &lead).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.unwrap()["result"], "new");

    let stored = ctx.state.repos.records.get("leads", lead.id).await.unwrap().unwrap();
    assert_eq!(stored.data.get("score"), Some(&FieldValue::Number(42.0)));
}
