use chrono::Utc;
use crm_shared::{
    json_display_string, ApprovalAction, ApprovalHistory, ApprovalRecordState, ApprovalStatus,
    ApprovalStep, ApprovalWorkflow, Record, RuleCondition,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::automation::conditions;
use crate::error::{ApiResult, AppError, FieldError, ValidationBuilder};
use crate::services::audit::{AuditAction, AuditEntryBuilder, AuditService};
use crate::store::{ModuleRepository, OutboxPayload, RecordRepository, WorkflowRepository};

pub const EVENT_APPROVED: &str = "record.approved";
pub const EVENT_REJECTED: &str = "record.rejected";

/// Client-supplied workflow definition, used for both create and replace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub criteria: Vec<RuleCondition>,
    pub steps: Vec<ApprovalStep>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Order-insensitive identity of a criteria list
fn criteria_key(criteria: &[RuleCondition]) -> Vec<(String, String, String)> {
    let mut key: Vec<(String, String, String)> = criteria
        .iter()
        .map(|c| {
            (
                c.field.clone(),
                format!("{:?}", c.operator),
                json_display_string(&c.value),
            )
        })
        .collect();
    key.sort();
    key.dedup();
    key
}

fn step_allows(step: &ApprovalStep, actor: &Actor) -> bool {
    step.approver_users.iter().any(|u| u == &actor.user_id)
        || step.approver_roles.iter().any(|r| actor.has_role(r))
}

pub struct ApprovalEngine {
    workflows: Arc<dyn WorkflowRepository>,
    records: Arc<dyn RecordRepository>,
    modules: Arc<dyn ModuleRepository>,
    audit: AuditService,
    /// Wakes the outbox dispatcher after a write that queued events
    outbox_signal: Arc<Notify>,
}

impl ApprovalEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        records: Arc<dyn RecordRepository>,
        modules: Arc<dyn ModuleRepository>,
        audit: AuditService,
        outbox_signal: Arc<Notify>,
    ) -> Self {
        Self { workflows, records, modules, audit, outbox_signal }
    }

    // ===== Workflow management =====

    async fn check_input(&self, input: &WorkflowInput) -> ApiResult<()> {
        if self.modules.find_by_name(&input.module).await?.is_none() {
            return Err(AppError::NotFound(format!("Module '{}'", input.module)));
        }

        let mut errors = ValidationBuilder::new();
        if input.name.trim().is_empty() {
            errors.push(FieldError::missing("name"));
        }
        if input.steps.is_empty() {
            errors.push(FieldError::missing("steps"));
        }
        for (i, step) in input.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                errors.push(FieldError::missing(&format!("steps[{}].name", i)));
            }
            if step.approver_users.is_empty() && step.approver_roles.is_empty() {
                errors.push(FieldError::invalid_format(
                    &format!("steps[{}]", i),
                    "a step needs at least one approver user or role",
                ));
            }
        }
        for (i, condition) in input.criteria.iter().enumerate() {
            if condition.field.trim().is_empty() {
                errors.push(FieldError::missing(&format!("criteria[{}].field", i)));
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Active workflows of a module may not overlap: at most one default
    /// (criteria-free) workflow, and no two with the same criteria.
    async fn check_conflicts(&self, candidate: &ApprovalWorkflow) -> ApiResult<()> {
        if !candidate.active {
            return Ok(());
        }

        let key = criteria_key(&candidate.criteria);
        let existing = self.workflows.list_by_module(&candidate.module).await?;

        for other in existing.iter().filter(|w| w.active && w.id != candidate.id) {
            if criteria_key(&other.criteria) != key {
                continue;
            }
            let message = if key.is_empty() {
                format!(
                    "Module '{}' already has an active default workflow '{}'",
                    candidate.module, other.name
                )
            } else {
                format!(
                    "Workflow '{}' already uses the same criteria for module '{}'",
                    other.name, candidate.module
                )
            };
            return Err(AppError::ConfigConflict(message));
        }
        Ok(())
    }

    pub async fn create_workflow(&self, input: WorkflowInput, actor_id: &str) -> ApiResult<ApprovalWorkflow> {
        self.check_input(&input).await?;

        let now = Utc::now();
        let workflow = ApprovalWorkflow {
            id: Uuid::new_v4(),
            module: input.module,
            name: input.name,
            priority: input.priority.unwrap_or(0),
            criteria: input.criteria,
            steps: input.steps,
            active: input.active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        self.check_conflicts(&workflow).await?;

        let workflow = self.workflows.create(workflow).await?;
        info!(workflow_id = %workflow.id, module = %workflow.module, "Created approval workflow '{}'", workflow.name);
        self.audit_workflow(&workflow, actor_id, "created").await;
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> ApiResult<ApprovalWorkflow> {
        self.workflows
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow {}", id)))
    }

    /// Workflows of a module in evaluation order
    pub async fn list_workflows(&self, module: &str) -> ApiResult<Vec<ApprovalWorkflow>> {
        let mut workflows = self.workflows.list_by_module(module).await?;
        workflows.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
        Ok(workflows)
    }

    pub async fn update_workflow(&self, id: Uuid, input: WorkflowInput, actor_id: &str) -> ApiResult<ApprovalWorkflow> {
        let existing = self.get_workflow(id).await?;
        self.check_input(&input).await?;

        let workflow = ApprovalWorkflow {
            id,
            module: input.module,
            name: input.name,
            priority: input.priority.unwrap_or(existing.priority),
            criteria: input.criteria,
            steps: input.steps,
            active: input.active.unwrap_or(existing.active),
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        self.check_conflicts(&workflow).await?;

        let workflow = self.workflows.update(workflow).await?;
        self.audit_workflow(&workflow, actor_id, "updated").await;
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, id: Uuid, actor_id: &str) -> ApiResult<()> {
        let workflow = self.get_workflow(id).await?;
        self.workflows.delete(id).await?;
        self.audit_workflow(&workflow, actor_id, "deleted").await;
        Ok(())
    }

    async fn audit_workflow(&self, workflow: &ApprovalWorkflow, actor_id: &str, change: &str) {
        self.audit
            .log(
                AuditEntryBuilder::new(AuditAction::WorkflowChange, workflow.module.clone())
                    .actor(actor_id)
                    .changes_json(serde_json::json!({
                        "workflow_id": workflow.id,
                        "name": workflow.name,
                        "change": change,
                    })),
            )
            .await;
    }

    // ===== Record approvals =====

    /// Picks the first active workflow, by (priority, created_at), whose
    /// criteria match the record. `None` means the record needs no approval.
    pub async fn initialize_approval(&self, module: &str, record: &Record) -> ApiResult<Option<ApprovalRecordState>> {
        let workflows = self.list_workflows(module).await?;

        let selected = workflows
            .iter()
            .filter(|w| w.active && !w.steps.is_empty())
            .find(|w| conditions::matches(&w.criteria, record));

        Ok(selected.map(|workflow| {
            info!(
                workflow_id = %workflow.id,
                record_id = %record.id,
                "Record enters approval workflow '{}'",
                workflow.name
            );
            ApprovalRecordState {
                status: ApprovalStatus::Pending,
                current_step: 0,
                workflow_id: workflow.id,
                history: Vec::new(),
            }
        }))
    }

    async fn load_pending(&self, module: &str, record_id: Uuid) -> ApiResult<(Record, ApprovalRecordState)> {
        let record = self
            .records
            .get(module, record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {}", record_id)))?;

        let state = match &record.approval {
            Some(state) if state.status == ApprovalStatus::Pending => state.clone(),
            Some(state) => {
                return Err(AppError::NotPending { status: state.status.as_str().to_string() });
            }
            None => return Err(AppError::NotPending { status: "not_required".to_string() }),
        };
        Ok((record, state))
    }

    pub async fn approve_record(
        &self,
        module: &str,
        record_id: Uuid,
        actor: &Actor,
        comment: &str,
    ) -> ApiResult<Record> {
        let (record, mut state) = self.load_pending(module, record_id).await?;
        let workflow = self.get_workflow(state.workflow_id).await?;

        let Some(step) = workflow.steps.get(state.current_step) else {
            return Err(AppError::InvalidStep { step: state.current_step, steps: workflow.steps.len() });
        };
        if !actor.is_admin && !step_allows(step, actor) {
            return Err(AppError::Forbidden(format!(
                "User {} is not an approver for step '{}'",
                actor.user_id, step.name
            )));
        }

        let previous = (state.status, state.current_step);
        state.history.push(ApprovalHistory {
            step_name: step.name.clone(),
            actor_id: actor.user_id.clone(),
            action: ApprovalAction::Approved,
            comment: comment.to_string(),
            timestamp: Utc::now(),
        });
        if state.current_step + 1 >= workflow.steps.len() {
            state.status = ApprovalStatus::Approved;
        } else {
            state.current_step += 1;
        }

        let events = match state.status {
            ApprovalStatus::Approved => vec![self.webhook_event(EVENT_APPROVED, &record, &state)],
            _ => Vec::new(),
        };
        let updated = self
            .records
            .update_approval(module, record_id, record.version, state.clone(), events)
            .await?;
        self.outbox_signal.notify_one();

        info!(
            record_id = %record_id,
            step = %step.name,
            status = state.status.as_str(),
            "Approval recorded by {}",
            actor.user_id
        );
        self.audit_transition(AuditAction::Approve, &updated, actor, previous, &state, &step.name, comment)
            .await;
        Ok(updated)
    }

    pub async fn reject_record(
        &self,
        module: &str,
        record_id: Uuid,
        actor: &Actor,
        comment: &str,
    ) -> ApiResult<Record> {
        let (record, mut state) = self.load_pending(module, record_id).await?;

        let step_name = match self.workflows.get(state.workflow_id).await? {
            Some(workflow) => {
                let Some(step) = workflow.steps.get(state.current_step) else {
                    return Err(AppError::InvalidStep { step: state.current_step, steps: workflow.steps.len() });
                };
                if !actor.is_admin && !step_allows(step, actor) {
                    return Err(AppError::Forbidden(format!(
                        "User {} is not an approver for step '{}'",
                        actor.user_id, step.name
                    )));
                }
                step.name.clone()
            }
            // Only an admin can release a record whose workflow was deleted
            None if actor.is_admin => {
                warn!(record_id = %record_id, workflow_id = %state.workflow_id, "Rejecting record of a deleted workflow");
                format!("step {}", state.current_step + 1)
            }
            None => return Err(AppError::NotFound(format!("Workflow {}", state.workflow_id))),
        };

        let previous = (state.status, state.current_step);
        state.history.push(ApprovalHistory {
            step_name: step_name.clone(),
            actor_id: actor.user_id.clone(),
            action: ApprovalAction::Rejected,
            comment: comment.to_string(),
            timestamp: Utc::now(),
        });
        state.status = ApprovalStatus::Rejected;

        let events = vec![self.webhook_event(EVENT_REJECTED, &record, &state)];
        let updated = self
            .records
            .update_approval(module, record_id, record.version, state.clone(), events)
            .await?;
        self.outbox_signal.notify_one();

        info!(record_id = %record_id, step = %step_name, "Record rejected by {}", actor.user_id);
        self.audit_transition(AuditAction::Reject, &updated, actor, previous, &state, &step_name, comment)
            .await;
        Ok(updated)
    }

    /// True when the record is pending and the actor is listed on its current step.
    pub async fn can_approve(&self, module: &str, record_id: Uuid, actor: &Actor) -> ApiResult<bool> {
        let record = self
            .records
            .get(module, record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {}", record_id)))?;

        let Some(state) = record.approval.as_ref().filter(|s| s.status == ApprovalStatus::Pending) else {
            return Ok(false);
        };
        let Some(workflow) = self.workflows.get(state.workflow_id).await? else {
            return Ok(false);
        };

        Ok(workflow
            .steps
            .get(state.current_step)
            .is_some_and(|step| step_allows(step, actor)))
    }

    fn webhook_event(&self, event: &str, record: &Record, state: &ApprovalRecordState) -> OutboxPayload {
        let mut snapshot = record.clone();
        snapshot.approval = Some(state.clone());
        OutboxPayload::webhook(event, &record.module, serde_json::Value::Object(snapshot.to_document()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_transition(
        &self,
        action: AuditAction,
        record: &Record,
        actor: &Actor,
        previous: (ApprovalStatus, usize),
        state: &ApprovalRecordState,
        step_name: &str,
        comment: &str,
    ) {
        self.audit
            .log(
                AuditEntryBuilder::new(action, record.module.clone())
                    .actor(actor.user_id.clone())
                    .record(record.id)
                    .changes_json(serde_json::json!({
                        "_approval": {
                            "old": {"status": previous.0, "current_step": previous.1},
                            "new": {"status": state.status, "current_step": state.current_step},
                        },
                        "step_name": step_name,
                        "comment": comment,
                    })),
            )
            .await;
    }
}
