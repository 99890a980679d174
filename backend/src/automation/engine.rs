// Automation Engine - Rule management and trigger processing

use chrono::Utc;
use crm_shared::{AutomationRule, Record, RuleAction, RuleCondition, TriggerType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{conditions, ActionExecutor, ActionResult, TriggerEvent};
use crate::error::{ApiResult, AppError, FieldError, ValidationBuilder};
use crate::services::audit::{AuditAction, AuditEntryBuilder, AuditService};
use crate::store::{ModuleRepository, RuleRepository};

/// Client-supplied rule definition, used for both create and replace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInput {
    pub module: String,
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

/// What happened when one rule ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecution {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub results: Vec<ActionResult>,
}

impl RuleExecution {
    pub fn failed_actions(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

pub struct AutomationEngine {
    rules: Arc<dyn RuleRepository>,
    modules: Arc<dyn ModuleRepository>,
    executor: Arc<ActionExecutor>,
    audit: AuditService,
}

impl AutomationEngine {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        modules: Arc<dyn ModuleRepository>,
        executor: Arc<ActionExecutor>,
        audit: AuditService,
    ) -> Self {
        Self { rules, modules, executor, audit }
    }

    /// Run every active rule of `module` for `trigger` whose conditions match.
    /// Errors never reach the caller; they are logged.
    pub async fn execute_from_trigger(&self, module: &str, record: &Record, trigger: TriggerType) -> Vec<RuleExecution> {
        let event = TriggerEvent::new(trigger, module, record.clone());
        match self.process_event(&event).await {
            Ok(executions) => executions,
            Err(e) => {
                error!(
                    module = %module,
                    record_id = %record.id,
                    trigger = trigger.as_str(),
                    "Failed to load automation rules: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    /// Like `execute_from_trigger`, but reports failure to load rules so the
    /// caller can retry the event.
    pub async fn process_event(&self, event: &TriggerEvent) -> ApiResult<Vec<RuleExecution>> {
        let rules = self.rules.list_by_module(&event.module).await?;
        let mut executions = Vec::new();

        debug!(
            event_id = %event.event_id,
            module = %event.module,
            trigger = event.trigger_type.as_str(),
            candidates = rules.len(),
            "Processing trigger"
        );

        for rule in rules
            .iter()
            .filter(|r| r.active && r.trigger_type == event.trigger_type)
        {
            if !conditions::matches(&rule.conditions, &event.record) {
                continue;
            }

            info!(
                rule_id = %rule.id,
                record_id = %event.record.id,
                "Rule '{}' matched",
                rule.name
            );

            let results = self
                .executor
                .execute_actions(&rule.actions, &event.module, &event.record)
                .await;

            let execution = RuleExecution {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                results,
            };
            if execution.failed_actions() > 0 {
                warn!(
                    rule_id = %rule.id,
                    failed = execution.failed_actions(),
                    "Rule '{}' finished with failed actions",
                    rule.name
                );
            }
            executions.push(execution);
        }

        Ok(executions)
    }

    // ===== Rule management =====

    async fn check_input(&self, input: &RuleInput) -> ApiResult<()> {
        if self.modules.find_by_name(&input.module).await?.is_none() {
            return Err(AppError::NotFound(format!("Module '{}'", input.module)));
        }

        let mut errors = ValidationBuilder::new();
        if input.name.trim().is_empty() {
            errors.push(FieldError::missing("name"));
        }
        if input.actions.is_empty() {
            errors.push(FieldError::missing("actions"));
        }
        for (i, condition) in input.conditions.iter().enumerate() {
            if condition.field.trim().is_empty() {
                errors.push(FieldError::missing(&format!("conditions[{}].field", i)));
            }
        }
        for (i, action) in input.actions.iter().enumerate() {
            let missing = action.missing_config();
            if !missing.is_empty() {
                errors.push(FieldError::invalid_format(
                    &format!("actions[{}].config", i),
                    format!("{} requires {}", action.kind(), missing.join(", ")),
                ));
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn create_rule(&self, input: RuleInput, actor_id: &str) -> ApiResult<AutomationRule> {
        self.check_input(&input).await?;

        let now = Utc::now();
        let rule = self
            .rules
            .create(AutomationRule {
                id: Uuid::new_v4(),
                module: input.module,
                name: input.name,
                trigger_type: input.trigger_type,
                active: input.active.unwrap_or(true),
                conditions: input.conditions,
                actions: input.actions,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(rule_id = %rule.id, module = %rule.module, "Created automation rule '{}'", rule.name);
        self.audit_rule(&rule, actor_id, "created").await;
        Ok(rule)
    }

    pub async fn get_rule(&self, id: Uuid) -> ApiResult<AutomationRule> {
        self.rules
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Rule {}", id)))
    }

    pub async fn list_rules(&self, module: Option<&str>) -> ApiResult<Vec<AutomationRule>> {
        match module {
            Some(module) => self.rules.list_by_module(module).await,
            None => self.rules.list().await,
        }
    }

    pub async fn update_rule(&self, id: Uuid, input: RuleInput, actor_id: &str) -> ApiResult<AutomationRule> {
        let existing = self.get_rule(id).await?;
        self.check_input(&input).await?;

        let rule = self
            .rules
            .update(AutomationRule {
                id,
                module: input.module,
                name: input.name,
                trigger_type: input.trigger_type,
                active: input.active.unwrap_or(existing.active),
                conditions: input.conditions,
                actions: input.actions,
                created_at: existing.created_at,
                updated_at: Utc::now(),
            })
            .await?;

        self.audit_rule(&rule, actor_id, "updated").await;
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid, actor_id: &str) -> ApiResult<()> {
        let rule = self.get_rule(id).await?;
        self.rules.delete(id).await?;
        self.audit_rule(&rule, actor_id, "deleted").await;
        Ok(())
    }

    async fn audit_rule(&self, rule: &AutomationRule, actor_id: &str, change: &str) {
        self.audit
            .log(
                AuditEntryBuilder::new(AuditAction::RuleChange, rule.module.clone())
                    .actor(actor_id)
                    .changes_json(serde_json::json!({
                        "rule_id": rule.id,
                        "name": rule.name,
                        "change": change,
                    })),
            )
            .await;
    }
}
