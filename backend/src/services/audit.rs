use chrono::Utc;
use crm_shared::{AuditLog, FieldMap};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::store::AuditRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Approve,
    Reject,
    RuleChange,
    WorkflowChange,
    ModuleChange,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RuleChange => "rule_change",
            Self::WorkflowChange => "workflow_change",
            Self::ModuleChange => "module_change",
        }
    }
}

/// Builder for creating audit log entries
pub struct AuditEntryBuilder {
    action: AuditAction,
    module: String,
    record_id: Option<Uuid>,
    actor_id: Option<String>,
    changes: Option<JsonValue>,
}

impl AuditEntryBuilder {
    pub fn new(action: AuditAction, module: impl Into<String>) -> Self {
        Self {
            action,
            module: module.into(),
            record_id: None,
            actor_id: None,
            changes: None,
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn record(mut self, id: Uuid) -> Self {
        self.record_id = Some(id);
        self
    }

    pub fn changes<T: Serialize>(mut self, changes: &T) -> Result<Self, serde_json::Error> {
        self.changes = Some(serde_json::to_value(changes)?);
        Ok(self)
    }

    pub fn changes_json(mut self, changes: JsonValue) -> Self {
        self.changes = Some(changes);
        self
    }

    fn build(self) -> AuditLog {
        AuditLog {
            id: Uuid::new_v4(),
            action: self.action.as_str().to_string(),
            module: self.module,
            record_id: self.record_id,
            actor_id: self.actor_id,
            changes: self.changes,
            created_at: Utc::now(),
        }
    }
}

/// Represents changes made during an update operation
#[derive(Debug, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: JsonValue,
    pub new: JsonValue,
}

/// Helper to track changes between old and new values
#[derive(Debug, Default)]
pub struct ChangeTracker {
    changes: serde_json::Map<String, JsonValue>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `field` when the value differs. Absent values show as null.
    pub fn track(&mut self, field: &str, old: Option<&JsonValue>, new: Option<&JsonValue>) -> bool {
        if old == new {
            return false;
        }
        let change = FieldChange {
            old: old.cloned().unwrap_or(JsonValue::Null),
            new: new.cloned().unwrap_or(JsonValue::Null),
        };
        self.changes
            .insert(field.to_string(), serde_json::to_value(change).unwrap_or_default());
        true
    }

    /// Diff two record data maps over the union of their keys.
    pub fn diff(old: &FieldMap, new: &FieldMap) -> Self {
        let mut tracker = Self::new();
        let keys: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for key in keys {
            let before = old.get(key).map(|v| v.to_json());
            let after = new.get(key).map(|v| v.to_json());
            tracker.track(key, before.as_ref(), after.as_ref());
        }
        tracker
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.changes)
    }
}

/// Best-effort audit trail. Failures to write are logged and swallowed.
#[derive(Clone)]
pub struct AuditService {
    repo: Arc<dyn AuditRepository>,
}

impl AuditService {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    pub async fn log(&self, entry: AuditEntryBuilder) {
        let entry = entry.build();
        let (action, module, record_id) = (entry.action.clone(), entry.module.clone(), entry.record_id);
        if let Err(e) = self.repo.insert(entry).await {
            warn!(
                action = %action,
                module = %module,
                record_id = ?record_id,
                "Failed to write audit entry: {}",
                e
            );
        }
    }

    /// Get audit logs for a specific record
    pub async fn record_history(&self, module: &str, record_id: Uuid) -> ApiResult<Vec<AuditLog>> {
        self.repo.list_for_record(module, record_id).await
    }
}
