use crm_shared::{ApprovalAction, ApprovalStatus, ConditionOperator, RuleCondition};
use serde_json::json;
use uuid::Uuid;

use crate::approvals::WorkflowInput;
use crate::error::AppError;
use crate::tests::fixtures::{approval_step, expense, finance_workflow, install_modules, record_id};
use crate::tests::helpers::{admin, user};
use crate::tests::TestContext;

async fn setup() -> TestContext {
    let ctx = TestContext::new().await;
    install_modules(&ctx).await;
    ctx
}

async fn pending_expense(ctx: &TestContext, amount: f64) -> Uuid {
    let doc = ctx
        .state
        .records
        .create_record("expenses", &expense(amount), &user("emp-1", &["staff"]))
        .await
        .unwrap();
    record_id(&doc)
}

fn two_step_workflow() -> WorkflowInput {
    WorkflowInput {
        steps: vec![
            approval_step("Manager", &["mgr-1"], &[]),
            approval_step("Finance", &[], &["finance"]),
        ],
        ..finance_workflow()
    }
}

#[tokio::test]
async fn test_finance_signs_off_large_expense() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    let id = pending_expense(&ctx, 5000.0).await;

    let finance = user("fin-1", &["finance"]);
    let sales = user("rep-1", &["sales"]);
    assert!(ctx.state.approvals.can_approve("expenses", id, &finance).await.unwrap());
    assert!(!ctx.state.approvals.can_approve("expenses", id, &sales).await.unwrap());

    let record = ctx
        .state
        .approvals
        .approve_record("expenses", id, &finance, "within budget")
        .await
        .unwrap();
    let state = record.approval.unwrap();
    assert_eq!(state.status, ApprovalStatus::Approved);
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].actor_id, "fin-1");
    assert_eq!(state.history[0].action, ApprovalAction::Approved);
    assert_eq!(state.history[0].comment, "within budget");

    // Finished approvals unlock the record
    assert!(!ctx.state.approvals.can_approve("expenses", id, &finance).await.unwrap());
    ctx.state.records.delete_record("expenses", id, &admin()).await.unwrap();
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    let finance = user("fin-1", &["finance"]);

    let rejected = pending_expense(&ctx, 2500.0).await;
    let record = ctx
        .state
        .approvals
        .reject_record("expenses", rejected, &finance, "no receipt")
        .await
        .unwrap();
    assert_eq!(record.approval.unwrap().status, ApprovalStatus::Rejected);

    let err = ctx
        .state
        .approvals
        .approve_record("expenses", rejected, &finance, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotPending { ref status } if status == "rejected"));

    let approved = pending_expense(&ctx, 2500.0).await;
    ctx.state.approvals.approve_record("expenses", approved, &finance, "").await.unwrap();
    let err = ctx
        .state
        .approvals
        .reject_record("expenses", approved, &finance, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotPending { ref status } if status == "approved"));

    let ungated = pending_expense(&ctx, 10.0).await;
    let err = ctx
        .state
        .approvals
        .approve_record("expenses", ungated, &finance, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotPending { ref status } if status == "not_required"));
}

#[tokio::test]
async fn test_only_listed_approvers_may_act() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    let id = pending_expense(&ctx, 5000.0).await;

    let err = ctx
        .state
        .approvals
        .approve_record("expenses", id, &user("rep-1", &["sales"]), "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = ctx
        .state
        .approvals
        .reject_record("expenses", id, &user("emp-1", &["staff"]), "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    // Admins may act on any step but are not listed as approvers
    assert!(!ctx.state.approvals.can_approve("expenses", id, &admin()).await.unwrap());
    let record = ctx.state.approvals.approve_record("expenses", id, &admin(), "override").await.unwrap();
    assert_eq!(record.approval.unwrap().status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_multi_step_workflow_advances() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(two_step_workflow(), "admin-1").await.unwrap();
    let id = pending_expense(&ctx, 5000.0).await;

    let manager = user("mgr-1", &[]);
    let finance = user("fin-1", &["finance"]);
    assert!(!ctx.state.approvals.can_approve("expenses", id, &finance).await.unwrap());

    let record = ctx.state.approvals.approve_record("expenses", id, &manager, "ok").await.unwrap();
    let state = record.approval.unwrap();
    assert_eq!(state.status, ApprovalStatus::Pending);
    assert_eq!(state.current_step, 1);

    assert!(!ctx.state.approvals.can_approve("expenses", id, &manager).await.unwrap());
    let err = ctx.state.approvals.approve_record("expenses", id, &manager, "").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let record = ctx.state.approvals.approve_record("expenses", id, &finance, "paid").await.unwrap();
    let state = record.approval.unwrap();
    assert_eq!(state.status, ApprovalStatus::Approved);
    let steps: Vec<&str> = state.history.iter().map(|h| h.step_name.as_str()).collect();
    assert_eq!(steps, vec!["Manager", "Finance"]);
}

#[tokio::test]
async fn test_lowest_priority_matching_workflow_wins() {
    let ctx = setup().await;

    let broad = ctx
        .state
        .approvals
        .create_workflow(
            WorkflowInput {
                name: "Any expense".to_string(),
                priority: Some(50),
                criteria: Vec::new(),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();
    let large = ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    ctx.state
        .approvals
        .create_workflow(
            WorkflowInput {
                name: "Equipment".to_string(),
                priority: Some(1),
                criteria: vec![RuleCondition::equals("category", json!("equipment"))],
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();

    let listed = ctx.state.approvals.list_workflows("expenses").await.unwrap();
    let priorities: Vec<i32> = listed.iter().map(|w| w.priority).collect();
    assert_eq!(priorities, vec![1, 10, 50]);

    let big = pending_expense(&ctx, 5000.0).await;
    let record = ctx.state.repos.records.get("expenses", big).await.unwrap().unwrap();
    assert_eq!(record.approval.unwrap().workflow_id, large.id);

    let small = pending_expense(&ctx, 20.0).await;
    let record = ctx.state.repos.records.get("expenses", small).await.unwrap().unwrap();
    assert_eq!(record.approval.unwrap().workflow_id, broad.id);
}

#[tokio::test]
async fn test_overlapping_workflows_conflict() {
    let ctx = setup().await;
    let criteria = vec![
        RuleCondition::new("amount", ConditionOperator::Gt, json!(1000)),
        RuleCondition::equals("category", json!("travel")),
    ];
    ctx.state
        .approvals
        .create_workflow(WorkflowInput { criteria: criteria.clone(), ..finance_workflow() }, "admin-1")
        .await
        .unwrap();

    let reordered: Vec<RuleCondition> = criteria.into_iter().rev().collect();
    let err = ctx
        .state
        .approvals
        .create_workflow(
            WorkflowInput {
                name: "Duplicate".to_string(),
                criteria: reordered.clone(),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigConflict(_)));

    // Inactive workflows never conflict
    ctx.state
        .approvals
        .create_workflow(
            WorkflowInput {
                name: "Draft".to_string(),
                criteria: reordered,
                active: Some(false),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_one_active_default_workflow_per_module() {
    let ctx = setup().await;
    let default = |name: &str, priority: i32| WorkflowInput {
        name: name.to_string(),
        priority: Some(priority),
        criteria: Vec::new(),
        ..finance_workflow()
    };

    ctx.state.approvals.create_workflow(default("Everything", 10), "admin-1").await.unwrap();

    // Priority does not make a second default acceptable
    let err = ctx
        .state
        .approvals
        .create_workflow(default("Everything else", 20), "admin-1")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigConflict(ref msg) if msg.contains("default")));

    ctx.state
        .approvals
        .create_workflow(WorkflowInput { active: Some(false), ..default("Parked", 30) }, "admin-1")
        .await
        .unwrap();
    ctx.state
        .approvals
        .create_workflow(WorkflowInput { module: "leads".to_string(), ..default("Leads", 10) }, "admin-1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reactivating_a_duplicate_conflicts() {
    let ctx = setup().await;
    ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();

    let draft = ctx
        .state
        .approvals
        .create_workflow(
            WorkflowInput {
                name: "Draft".to_string(),
                active: Some(false),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();

    let err = ctx
        .state
        .approvals
        .update_workflow(
            draft.id,
            WorkflowInput {
                name: "Draft".to_string(),
                active: Some(true),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigConflict(_)));
    assert!(!ctx.state.approvals.get_workflow(draft.id).await.unwrap().active);

    // Keeping it inactive is still allowed
    let renamed = ctx
        .state
        .approvals
        .update_workflow(
            draft.id,
            WorkflowInput {
                name: "Draft v2".to_string(),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();
    assert!(!renamed.active);
    assert_eq!(renamed.name, "Draft v2");
}

#[tokio::test]
async fn test_moving_a_workflow_checks_the_target_module() {
    let ctx = setup().await;
    let leads_default = ctx
        .state
        .approvals
        .create_workflow(
            WorkflowInput {
                module: "leads".to_string(),
                criteria: Vec::new(),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();
    let expenses_default = ctx
        .state
        .approvals
        .create_workflow(WorkflowInput { criteria: Vec::new(), ..finance_workflow() }, "admin-1")
        .await
        .unwrap();

    let err = ctx
        .state
        .approvals
        .update_workflow(
            expenses_default.id,
            WorkflowInput {
                module: "leads".to_string(),
                criteria: Vec::new(),
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigConflict(_)));

    let moved = ctx
        .state
        .approvals
        .update_workflow(
            expenses_default.id,
            WorkflowInput {
                module: "leads".to_string(),
                criteria: vec![RuleCondition::equals("stage", json!("won"))],
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap();
    assert_eq!(moved.module, "leads");

    assert!(ctx.state.approvals.list_workflows("expenses").await.unwrap().is_empty());
    let ids: Vec<Uuid> = ctx
        .state
        .approvals
        .list_workflows("leads")
        .await
        .unwrap()
        .iter()
        .map(|w| w.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&leads_default.id) && ids.contains(&moved.id));
}

#[tokio::test]
async fn test_workflow_definition_is_validated() {
    let ctx = setup().await;

    let err = ctx
        .state
        .approvals
        .create_workflow(
            WorkflowInput {
                steps: vec![approval_step("Nobody", &[], &[])],
                ..finance_workflow()
            },
            "admin-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationError { .. }));

    let err = ctx
        .state
        .approvals
        .create_workflow(WorkflowInput { module: "ghosts".to_string(), ..finance_workflow() }, "admin-1")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_deleted_workflow_needs_admin_to_release() {
    let ctx = setup().await;
    let workflow = ctx.state.approvals.create_workflow(finance_workflow(), "admin-1").await.unwrap();
    let id = pending_expense(&ctx, 5000.0).await;

    ctx.state.approvals.delete_workflow(workflow.id, "admin-1").await.unwrap();

    let finance = user("fin-1", &["finance"]);
    assert!(!ctx.state.approvals.can_approve("expenses", id, &finance).await.unwrap());
    let err = ctx.state.approvals.reject_record("expenses", id, &finance, "").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let record = ctx.state.approvals.reject_record("expenses", id, &admin(), "orphaned").await.unwrap();
    assert_eq!(record.approval.unwrap().status, ApprovalStatus::Rejected);
}
