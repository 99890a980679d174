// In-memory store - backs tests and local runs without Postgres

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::{
    ApprovalRecordState, ApprovalWorkflow, AuditLog, AutomationRule, FieldMap, FieldPermission,
    FieldValue, Module, ModuleField, Record,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuditRepository, FileRepository, ListQuery, ModuleRepository, OutboxEvent, OutboxPayload,
    OutboxRepository, OutboxStatus, RecordRepository, RuleRepository, StoredFile,
    WorkflowRepository,
};
use crate::error::{ApiResult, AppError};

#[derive(Default)]
struct State {
    modules: HashMap<String, Module>,
    records: HashMap<Uuid, Record>,
    rules: HashMap<Uuid, AutomationRule>,
    workflows: HashMap<Uuid, ApprovalWorkflow>,
    audit: Vec<AuditLog>,
    outbox: Vec<OutboxEvent>,
    files: HashMap<Uuid, StoredFile>,
}

impl State {
    fn enqueue(&mut self, events: Vec<OutboxPayload>) {
        self.outbox.extend(events.into_iter().map(OutboxEvent::new));
    }

    fn record_mut(&mut self, module: &str, id: Uuid) -> ApiResult<&mut Record> {
        self.records
            .get_mut(&id)
            .filter(|r| r.module == module)
            .ok_or_else(|| AppError::NotFound(format!("Record {}", id)))
    }
}

/// One lock guards every collection so a record write and its outbox
/// events become visible together.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox event, oldest first.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.read().await.outbox.clone()
    }

    pub async fn audit_entries(&self) -> Vec<AuditLog> {
        self.state.read().await.audit.clone()
    }
}

fn matches_filter(record: &Record, filter: &FieldMap) -> bool {
    filter.iter().all(|(field, expected)| {
        match record.field_value(field) {
            Some(FieldValue::List(items)) if !matches!(expected, FieldValue::List(_)) => {
                items.contains(expected)
            }
            Some(actual) => &actual == expected,
            None => expected.is_null(),
        }
    })
}

#[async_trait]
impl ModuleRepository for MemoryStore {
    async fn find_by_name(&self, name: &str) -> ApiResult<Option<Module>> {
        Ok(self.state.read().await.modules.get(name).cloned())
    }

    async fn list(&self) -> ApiResult<Vec<Module>> {
        let mut modules: Vec<Module> = self.state.read().await.modules.values().cloned().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    async fn create(&self, module: Module) -> ApiResult<Module> {
        let mut state = self.state.write().await;
        if state.modules.contains_key(&module.name) {
            return Err(AppError::ConfigConflict(format!("Module '{}' already exists", module.name)));
        }
        state.modules.insert(module.name.clone(), module.clone());
        Ok(module)
    }

    async fn update_fields(
        &self,
        name: &str,
        fields: Vec<ModuleField>,
        field_permissions: Vec<FieldPermission>,
    ) -> ApiResult<Module> {
        let mut state = self.state.write().await;
        let module = state
            .modules
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("Module '{}'", name)))?;
        module.fields = fields;
        module.field_permissions = field_permissions;
        Ok(module.clone())
    }
}

#[async_trait]
impl RecordRepository for MemoryStore {
    async fn get(&self, module: &str, id: Uuid) -> ApiResult<Option<Record>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(&id)
            .filter(|r| r.module == module)
            .cloned())
    }

    async fn list(&self, module: &str, query: &ListQuery) -> ApiResult<(Vec<Record>, i64)> {
        let state = self.state.read().await;
        let mut matching: Vec<Record> = state
            .records
            .values()
            .filter(|r| r.module == module && matches_filter(r, &query.filter))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let left = a.field_value(&query.sort.field).unwrap_or(FieldValue::Null);
            let right = b.field_value(&query.sort.field).unwrap_or(FieldValue::Null);
            let ordering = left.sort_cmp(&right).then_with(|| a.id.cmp(&b.id));
            if query.sort.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn exists(&self, module: &str, id: Uuid) -> ApiResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(&id)
            .is_some_and(|r| r.module == module))
    }

    async fn create(&self, mut record: Record, events: Vec<OutboxPayload>) -> ApiResult<Record> {
        let mut state = self.state.write().await;
        record.version = 1;
        state.records.insert(record.id, record.clone());
        state.enqueue(events);
        Ok(record)
    }

    async fn update(
        &self,
        record: Record,
        expected_version: i64,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record> {
        let mut state = self.state.write().await;
        let stored = state.record_mut(&record.module, record.id)?;
        if stored.version != expected_version {
            return Err(AppError::ConcurrentModification { record_id: record.id });
        }
        stored.data = record.data;
        stored.owner = record.owner;
        stored.updated_at = Utc::now();
        stored.version += 1;
        let updated = stored.clone();
        state.enqueue(events);
        Ok(updated)
    }

    async fn set_fields(&self, module: &str, id: Uuid, fields: FieldMap) -> ApiResult<Record> {
        let mut state = self.state.write().await;
        let stored = state.record_mut(module, id)?;
        stored.data.extend(fields);
        stored.updated_at = Utc::now();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn update_approval(
        &self,
        module: &str,
        id: Uuid,
        expected_version: i64,
        approval: ApprovalRecordState,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record> {
        let mut state = self.state.write().await;
        let stored = state.record_mut(module, id)?;
        if stored.version != expected_version {
            return Err(AppError::ConcurrentModification { record_id: id });
        }
        stored.approval = Some(approval);
        stored.updated_at = Utc::now();
        stored.version += 1;
        let updated = stored.clone();
        state.enqueue(events);
        Ok(updated)
    }

    async fn delete(&self, module: &str, id: Uuid, events: Vec<OutboxPayload>) -> ApiResult<()> {
        let mut state = self.state.write().await;
        state.record_mut(module, id)?;
        state.records.remove(&id);
        state.enqueue(events);
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn create(&self, rule: AutomationRule) -> ApiResult<AutomationRule> {
        self.state.write().await.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get(&self, id: Uuid) -> ApiResult<Option<AutomationRule>> {
        Ok(self.state.read().await.rules.get(&id).cloned())
    }

    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self
            .state
            .read()
            .await
            .rules
            .values()
            .filter(|r| r.module == module)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }

    async fn list(&self) -> ApiResult<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self.state.read().await.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }

    async fn update(&self, rule: AutomationRule) -> ApiResult<AutomationRule> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(&rule.id) {
            return Err(AppError::NotFound(format!("Rule {}", rule.id)));
        }
        state.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete(&self, id: Uuid) -> ApiResult<()> {
        self.state
            .write()
            .await
            .rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Rule {}", id)))
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn create(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow> {
        self.state.write().await.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get(&self, id: Uuid) -> ApiResult<Option<ApprovalWorkflow>> {
        Ok(self.state.read().await.workflows.get(&id).cloned())
    }

    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<ApprovalWorkflow>> {
        let mut workflows: Vec<ApprovalWorkflow> = self
            .state
            .read()
            .await
            .workflows
            .values()
            .filter(|w| w.module == module)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(workflows)
    }

    async fn update(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow> {
        let mut state = self.state.write().await;
        if !state.workflows.contains_key(&workflow.id) {
            return Err(AppError::NotFound(format!("Workflow {}", workflow.id)));
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn delete(&self, id: Uuid) -> ApiResult<()> {
        self.state
            .write()
            .await
            .workflows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Workflow {}", id)))
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn insert(&self, entry: AuditLog) -> ApiResult<()> {
        self.state.write().await.audit.push(entry);
        Ok(())
    }

    async fn list_for_record(&self, module: &str, record_id: Uuid) -> ApiResult<Vec<AuditLog>> {
        let mut entries: Vec<AuditLog> = self
            .state
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.module == module && e.record_id == Some(record_id))
            .cloned()
            .collect();
        entries.reverse();
        Ok(entries)
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    async fn claim_pending(&self, limit: i64) -> ApiResult<Vec<OutboxEvent>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut claimed = Vec::new();
        for event in state.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if event.status == OutboxStatus::Pending {
                event.status = OutboxStatus::Processing;
                event.claimed_at = Some(now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid) -> ApiResult<()> {
        let mut state = self.state.write().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id) {
            event.status = OutboxStatus::Processed;
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: i32) -> ApiResult<OutboxStatus> {
        let mut state = self.state.write().await;
        let event = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Outbox event {}", id)))?;
        event.attempts += 1;
        event.last_error = Some(error.to_string());
        event.status = if event.attempts >= max_attempts {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Pending
        };
        Ok(event.status)
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> ApiResult<u64> {
        let mut state = self.state.write().await;
        let mut count = 0;
        for event in state.outbox.iter_mut() {
            if event.status == OutboxStatus::Processing && event.claimed_at.is_some_and(|at| at < cutoff) {
                event.status = OutboxStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_processed(&self, cutoff: DateTime<Utc>) -> ApiResult<u64> {
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state.outbox.retain(|e| {
            !(e.status == OutboxStatus::Processed && e.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn pending_count(&self) -> ApiResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as i64)
    }
}

#[async_trait]
impl FileRepository for MemoryStore {
    async fn get_file(&self, id: Uuid) -> ApiResult<Option<StoredFile>> {
        Ok(self.state.read().await.files.get(&id).cloned())
    }

    async fn create_file(&self, file: StoredFile) -> ApiResult<StoredFile> {
        self.state.write().await.files.insert(file.id, file.clone());
        Ok(file)
    }
}
