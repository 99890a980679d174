use crm_shared::{CreateTaskConfig, RuleAction, RuleCondition, TriggerType};
use serde_json::json;
use std::sync::Arc;
use wiremock::MockServer;

use crate::automation::{RuleInput, TriggerEvent};
use crate::services::email::MockMailer;
use crate::services::system_modules::TASKS;
use crate::services::webhooks::{sign, SIGNATURE_HEADER};
use crate::store::{ListQuery, OutboxStatus};
use crate::tests::fixtures::{expense, finance_workflow, install_modules, lead, record_id, won_lead_rule};
use crate::tests::helpers::{admin, mount_receiver, subscribe_webhook, user};
use crate::tests::TestContext;
use crate::validation::RawFields;

async fn setup() -> TestContext {
    let ctx = TestContext::new().await;
    install_modules(&ctx).await;
    ctx
}

fn stage(value: &str) -> RawFields {
    json!({ "stage": value }).as_object().cloned().unwrap()
}

fn follow_up_rule() -> RuleInput {
    RuleInput {
        module: "leads".to_string(),
        name: "Follow up new leads".to_string(),
        trigger_type: TriggerType::Create,
        active: None,
        conditions: vec![RuleCondition::equals("stage", json!("new"))],
        actions: vec![RuleAction::CreateTask(CreateTaskConfig {
            subject: "Follow up with {{name}}".to_string(),
            assigned_to: Some("{{owner}}".to_string()),
            ..Default::default()
        })],
    }
}

#[tokio::test]
async fn test_won_lead_is_closed_by_rule() {
    let ctx = setup().await;
    ctx.state.automation.create_rule(won_lead_rule(), "admin-1").await.unwrap();

    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    let id = record_id(&doc);

    ctx.state.records.update_record("leads", id, &stage("lost"), &admin()).await.unwrap();
    ctx.drain().await;
    let current = ctx.state.records.get_record("leads", id, &admin()).await.unwrap();
    assert_eq!(current["status"], "open");

    ctx.state.records.update_record("leads", id, &stage("won"), &admin()).await.unwrap();
    ctx.drain().await;
    let current = ctx.state.records.get_record("leads", id, &admin()).await.unwrap();
    assert_eq!(current["status"], "closed");

    // The rule's own write queues nothing, so the outbox is empty afterwards
    assert_eq!(ctx.drain().await, 0);
    assert!(ctx
        .store
        .outbox_events()
        .await
        .iter()
        .all(|e| e.status == OutboxStatus::Processed));
}

#[tokio::test]
async fn test_create_rule_runs_once_per_record() {
    let ctx = setup().await;
    ctx.state.automation.create_rule(follow_up_rule(), "admin-1").await.unwrap();

    let rep = user("rep-1", &["sales"]);
    ctx.state.records.create_record("leads", &lead("new"), &rep).await.unwrap();
    ctx.state.records.create_record("leads", &lead("qualified"), &rep).await.unwrap();
    ctx.drain().await;

    let (tasks, total) = ctx.state.repos.records.list(TASKS, &ListQuery::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(
        tasks[0].data.get("assigned_to").and_then(|v| v.as_str()),
        Some("rep-1")
    );
}

#[tokio::test]
async fn test_inactive_rules_are_skipped() {
    let ctx = setup().await;
    ctx.state
        .automation
        .create_rule(RuleInput { active: Some(false), ..follow_up_rule() }, "admin-1")
        .await
        .unwrap();

    ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    ctx.drain().await;

    let (_, total) = ctx.state.repos.records.list(TASKS, &ListQuery::default()).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_process_event_reports_executions() {
    let ctx = setup().await;
    ctx.state.automation.create_rule(follow_up_rule(), "admin-1").await.unwrap();
    ctx.state.automation.create_rule(won_lead_rule(), "admin-1").await.unwrap();

    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    let record = ctx.state.repos.records.get("leads", record_id(&doc)).await.unwrap().unwrap();

    let executions = ctx.state.automation.process_event(&TriggerEvent::created(record.clone())).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].rule_name, "Follow up new leads");
    assert_eq!(executions[0].failed_actions(), 0);

    // Stage is still "new", so the update rule's condition fails
    let executions = ctx.state.automation.process_event(&TriggerEvent::updated(record)).await.unwrap();
    assert!(executions.is_empty());
}

#[tokio::test]
async fn test_rules_run_independently() {
    let ctx = setup().await;
    let broken = RuleInput {
        name: "Broken hook".to_string(),
        actions: vec![RuleAction::Webhook(crm_shared::WebhookConfig {
            url: "http://127.0.0.1:1/unreachable".to_string(),
            ..Default::default()
        })],
        ..follow_up_rule()
    };
    ctx.state.automation.create_rule(broken, "admin-1").await.unwrap();
    ctx.state.automation.create_rule(follow_up_rule(), "admin-1").await.unwrap();

    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    let record = ctx.state.repos.records.get("leads", record_id(&doc)).await.unwrap().unwrap();

    let executions = ctx
        .state
        .automation
        .execute_from_trigger("leads", &record, TriggerType::Create)
        .await;
    assert_eq!(executions.len(), 2);
    let mut failures: Vec<usize> = executions.iter().map(|e| e.failed_actions()).collect();
    failures.sort();
    assert_eq!(failures, vec![0, 1]);

    let (_, total) = ctx.state.repos.records.list(TASKS, &ListQuery::default()).await.unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_failed_email_does_not_fail_the_event() {
    let mut mailer = MockMailer::new();
    mailer
        .expect_send_email()
        .times(1)
        .returning(|_, _, _| Err(crate::services::MailError::Transport("smtp down".to_string())));
    let ctx = TestContext::with_mailer(Arc::new(mailer)).await;
    install_modules(&ctx).await;

    let rule = RuleInput {
        actions: vec![
            RuleAction::SendEmail(crm_shared::SendEmailConfig {
                to: "team@example.com".to_string(),
                subject: Some("New lead".to_string()),
                body: Some("{{name}}".to_string()),
                ..Default::default()
            }),
            RuleAction::CreateTask(CreateTaskConfig {
                subject: "Call {{name}}".to_string(),
                ..Default::default()
            }),
        ],
        ..follow_up_rule()
    };
    ctx.state.automation.create_rule(rule, "admin-1").await.unwrap();

    ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    ctx.drain().await;

    let (_, total) = ctx.state.repos.records.list(TASKS, &ListQuery::default()).await.unwrap();
    assert_eq!(total, 1);
    assert!(ctx
        .store
        .outbox_events()
        .await
        .iter()
        .all(|e| e.status == OutboxStatus::Processed));
}

#[tokio::test]
async fn test_webhook_subscribers_receive_signed_events() {
    let ctx = setup().await;
    let server = MockServer::start().await;
    mount_receiver(&server, "/signed", 200).await;
    mount_receiver(&server, "/contacts-only", 200).await;

    let url = format!("{}/signed", server.uri());
    subscribe_webhook(&ctx, &url, &["record.created", "record.updated"], "leads", Some("s3cret")).await;
    let other = format!("{}/contacts-only", server.uri());
    subscribe_webhook(&ctx, &other, &["record.created"], "contacts", None).await;

    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    ctx.drain().await;

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.url.path(), "/signed");

    let expected = sign("s3cret", &request.body).unwrap();
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert_eq!(signature, expected);

    let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload["event"], "record.created");
    assert_eq!(payload["module"], "leads");
    assert_eq!(payload["data"]["_id"], doc["_id"]);
}

#[tokio::test]
async fn test_unreachable_subscriber_does_not_block_outbox() {
    let ctx = setup().await;
    let server = MockServer::start().await;
    mount_receiver(&server, "/flaky", 503).await;
    subscribe_webhook(&ctx, &format!("{}/flaky", server.uri()), &["record.created"], "", None).await;

    ctx.state.records.create_record("contacts", &crate::tests::fixtures::fake_contact(), &admin()).await.unwrap();
    ctx.drain().await;

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(ctx.state.repos.outbox.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_approval_outcome_is_published() {
    let ctx = setup().await;
    let server = MockServer::start().await;
    mount_receiver(&server, "/approvals", 200).await;
    subscribe_webhook(
        &ctx,
        &format!("{}/approvals", server.uri()),
        &["record.approved", "record.rejected"],
        "expenses",
        None,
    )
    .await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();

    let doc = ctx.state.records.create_record("expenses", &expense(9000.0), &admin()).await.unwrap();
    ctx.state
        .approvals
        .approve_record("expenses", record_id(&doc), &user("fin-1", &["finance"]), "")
        .await
        .unwrap();
    ctx.drain().await;

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(payload["event"], "record.approved");
    assert_eq!(payload["data"]["_approval"]["status"], "approved");
}
