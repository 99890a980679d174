use chrono::Utc;
use crm_shared::{FieldAccess, FieldPermission};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::audit::AuditAction;
use crate::store::{ListQuery, OutboxPayload, StoredFile};
use crate::tests::fixtures::{
    contacts_module, expense, fake_contact, finance_workflow, install_modules, lead, record_id,
};
use crate::tests::helpers::{admin, user};
use crate::tests::TestContext;
use crate::validation::RawFields;

fn fields(value: serde_json::Value) -> RawFields {
    value.as_object().cloned().unwrap()
}

async fn setup() -> TestContext {
    let ctx = TestContext::new().await;
    install_modules(&ctx).await;
    ctx
}

#[tokio::test]
async fn test_create_reports_every_invalid_field() {
    let ctx = setup().await;

    let err = ctx
        .state
        .records
        .create_record(
            "leads",
            &fields(json!({ "status": "maybe", "margin": "lots" })),
            &admin(),
        )
        .await
        .unwrap_err();

    match err {
        AppError::ValidationError { errors } => {
            let mut names: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
            names.sort();
            assert_eq!(names, vec!["margin", "name", "stage", "status"]);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(ctx.store.outbox_events().await.is_empty());
}

#[tokio::test]
async fn test_system_keys_in_input_are_ignored() {
    let ctx = setup().await;
    let forged = Uuid::new_v4();

    let mut input = lead("new");
    input.insert("_id".into(), json!(forged));
    input.insert("owner".into(), json!("someone-else"));

    let doc = ctx.state.records.create_record("leads", &input, &user("u1", &[])).await.unwrap();
    assert_ne!(record_id(&doc), forged);
    assert_eq!(doc["owner"], "u1");
    assert_eq!(doc["created_by"], "u1");
}

#[tokio::test]
async fn test_create_queues_automation_and_webhook() {
    let ctx = setup().await;

    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    let id = record_id(&doc);

    let events = ctx.store.outbox_events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        OutboxPayload::AutomationTrigger { record, .. } if record.id == id
    )));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        OutboxPayload::Webhook { event, .. } if event == "record.created"
    )));

    let audit = ctx.store.audit_entries().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::Create.as_str());
}

#[tokio::test]
async fn test_field_permissions_mask_reads_and_writes() {
    let ctx = setup().await;
    let sales = user("rep-1", &["sales"]);

    let mut input = lead("new");
    input.insert("margin".into(), json!(0.35));
    input.insert("score".into(), json!(80));
    let doc = ctx.state.records.create_record("leads", &input, &admin()).await.unwrap();
    let id = record_id(&doc);
    assert_eq!(doc["margin"], 0.35);

    let seen = ctx.state.records.get_record("leads", id, &sales).await.unwrap();
    assert!(!seen.contains_key("margin"));
    assert_eq!(seen["score"], 80.0);

    for field in ["score", "margin"] {
        let err = ctx
            .state
            .records
            .update_record("leads", id, &fields(json!({ field.to_string(): 1 })), &sales)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)), "{} should not be writable", field);
    }

    let updated = ctx
        .state
        .records
        .update_record("leads", id, &fields(json!({ "stage": "qualified" })), &sales)
        .await
        .unwrap();
    assert_eq!(updated["stage"], "qualified");
    assert!(!updated.contains_key("margin"));
}

#[tokio::test]
async fn test_list_rejects_hidden_filters_and_unknown_sort() {
    let ctx = setup().await;
    let sales = user("rep-1", &["sales"]);

    let err = ctx
        .state
        .records
        .list_records("leads", &fields(json!({ "margin": "0.3" })), ListQuery::default(), &sales)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let mut query = ListQuery::default();
    query.sort.field = "nope".to_string();
    let err = ctx
        .state
        .records
        .list_records("leads", &RawFields::new(), query, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_list_filters_by_field() {
    let ctx = setup().await;
    for stage in ["new", "won", "new"] {
        ctx.state.records.create_record("leads", &lead(stage), &admin()).await.unwrap();
    }

    let page = ctx
        .state
        .records
        .list_records("leads", &fields(json!({ "stage": "new" })), ListQuery::default(), &admin())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page.records.iter().all(|r| r["stage"] == "new"));
}

#[tokio::test]
async fn test_lookups_and_files_are_resolved() {
    let ctx = setup().await;

    let contact = fake_contact();
    let contact_name = contact["name"].clone();
    let contact_doc = ctx.state.records.create_record("contacts", &contact, &admin()).await.unwrap();
    let contact_id = record_id(&contact_doc);

    let file = ctx
        .state
        .repos
        .files
        .create_file(StoredFile {
            id: Uuid::new_v4(),
            filename: "brochure.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 2048,
            url: "https://files.example.com/brochure.pdf".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut input = lead("new");
    input.insert("contact".into(), json!(contact_id));
    input.insert("brochure".into(), json!(file.id));
    let doc = ctx.state.records.create_record("leads", &input, &admin()).await.unwrap();

    assert_eq!(doc["contact"]["id"], contact_id.to_string());
    assert_eq!(doc["contact"]["module"], "contacts");
    assert_eq!(doc["contact"]["display"], contact_name);
    assert_eq!(doc["brochure"]["filename"], "brochure.pdf");
    assert_eq!(doc["brochure"]["url"], "https://files.example.com/brochure.pdf");
}

#[tokio::test]
async fn test_lookup_display_respects_target_field_mask() {
    let ctx = setup().await;

    let contacts = contacts_module();
    ctx.state
        .repos
        .modules
        .update_fields(
            "contacts",
            contacts.fields,
            vec![FieldPermission {
                role_id: "sales".to_string(),
                field: "name".to_string(),
                access: FieldAccess::Hidden,
            }],
        )
        .await
        .unwrap();

    let contact = fake_contact();
    let contact_name = contact["name"].clone();
    let contact_doc = ctx.state.records.create_record("contacts", &contact, &admin()).await.unwrap();
    let contact_id = record_id(&contact_doc);

    let mut input = lead("new");
    input.insert("contact".into(), json!(contact_id));
    let lead_doc = ctx.state.records.create_record("leads", &input, &admin()).await.unwrap();
    let lead_id = record_id(&lead_doc);

    let seen_by_sales = ctx.state.records.get_record("leads", lead_id, &user("s1", &["sales"])).await.unwrap();
    assert_eq!(seen_by_sales["contact"]["id"], contact_id.to_string());
    assert!(seen_by_sales["contact"]["display"].is_null());

    let page = ctx
        .state
        .records
        .list_records("leads", &RawFields::new(), ListQuery::default(), &user("s1", &["sales"]))
        .await
        .unwrap();
    assert!(page.records[0]["contact"]["display"].is_null());

    let seen_by_support = ctx.state.records.get_record("leads", lead_id, &user("s2", &["support"])).await.unwrap();
    assert_eq!(seen_by_support["contact"]["display"], contact_name);
}

#[tokio::test]
async fn test_dangling_lookup_is_rejected() {
    let ctx = setup().await;

    let mut input = lead("new");
    input.insert("contact".into(), json!(Uuid::new_v4()));
    let err = ctx.state.records.create_record("leads", &input, &admin()).await.unwrap_err();
    assert!(matches!(err, AppError::DanglingReference { ref target, .. } if target == "contacts"));
}

#[tokio::test]
async fn test_pending_approval_locks_record() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();

    let doc = ctx.state.records.create_record("expenses", &expense(5000.0), &user("u1", &[])).await.unwrap();
    let id = record_id(&doc);
    assert_eq!(doc["_approval"]["status"], "pending");

    let err = ctx
        .state
        .records
        .update_record("expenses", id, &fields(json!({ "amount": "not a number" })), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RecordLocked { record_id } if record_id == id));

    let err = ctx.state.records.delete_record("expenses", id, &admin()).await.unwrap_err();
    assert!(matches!(err, AppError::RecordLocked { .. }));

    // Below the threshold no workflow applies
    let small = ctx.state.records.create_record("expenses", &expense(50.0), &user("u1", &[])).await.unwrap();
    assert!(!small.contains_key("_approval"));
    ctx.state.records.delete_record("expenses", record_id(&small), &admin()).await.unwrap();
}

#[tokio::test]
async fn test_update_audits_only_real_changes() {
    let ctx = setup().await;
    let doc = ctx.state.records.create_record("leads", &lead("new"), &admin()).await.unwrap();
    let id = record_id(&doc);

    ctx.state
        .records
        .update_record("leads", id, &fields(json!({ "stage": "new" })), &admin())
        .await
        .unwrap();
    ctx.state
        .records
        .update_record("leads", id, &fields(json!({ "stage": "won" })), &admin())
        .await
        .unwrap();

    let history = ctx.state.audit.record_history("leads", id).await.unwrap();
    assert_eq!(history.iter().filter(|h| h.action == "update").count(), 1);

    let update = history.iter().find(|h| h.action == "update").unwrap();
    let changes = update.changes.as_ref().unwrap();
    assert_eq!(changes["stage"]["old"], "new");
    assert_eq!(changes["stage"]["new"], "won");
}

#[tokio::test]
async fn test_delete_removes_record_and_queues_webhook() {
    let ctx = setup().await;
    let doc = ctx.state.records.create_record("contacts", &fake_contact(), &admin()).await.unwrap();
    let id = record_id(&doc);

    ctx.state.records.delete_record("contacts", id, &admin()).await.unwrap();

    let err = ctx.state.records.get_record("contacts", id, &admin()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(ctx.store.outbox_events().await.iter().any(|e| matches!(
        &e.payload,
        OutboxPayload::Webhook { event, .. } if event == "record.deleted"
    )));
}
