// Storage Layer - Repository traits shared by the Postgres and in-memory stores
//
// Records are versioned documents. Writes that must reach the outbox carry
// their events so both land in one transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::{
    ApprovalRecordState, ApprovalWorkflow, AuditLog, AutomationRule, FieldMap, FieldPermission,
    Module, ModuleField, Record, TriggerType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Sort order for record listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: "created_at".to_string(),
            descending: true,
        }
    }
}

/// Equality filter plus paging for `RecordRepository::list`
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub filter: FieldMap,
    pub limit: i64,
    pub offset: i64,
    pub sort: SortSpec,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: FieldMap::new(),
            limit: 100,
            offset: 0,
            sort: SortSpec::default(),
        }
    }
}

/// Side effect recorded next to a record change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxPayload {
    AutomationTrigger {
        module: String,
        trigger: TriggerType,
        record: Record,
    },
    Webhook {
        event: String,
        module: String,
        record: serde_json::Value,
    },
}

impl OutboxPayload {
    pub fn automation(trigger: TriggerType, record: &Record) -> Self {
        Self::AutomationTrigger {
            module: record.module.clone(),
            trigger,
            record: record.clone(),
        }
    }

    pub fn webhook(event: &str, module: &str, record: serde_json::Value) -> Self {
        Self::Webhook {
            event: event.to_string(),
            module: module.to_string(),
            record,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::AutomationTrigger { module, trigger, .. } => {
                format!("automation:{}:{}", module, trigger.as_str())
            }
            Self::Webhook { event, module, .. } => format!("webhook:{}:{}", module, event),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub payload: OutboxPayload,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(payload: OutboxPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        }
    }
}

/// Metadata for an uploaded file referenced by `file`/`image` fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ModuleRepository: Send + Sync {
    async fn find_by_name(&self, name: &str) -> ApiResult<Option<Module>>;
    async fn list(&self) -> ApiResult<Vec<Module>>;
    /// Fails with `ConfigConflict` when the name is taken.
    async fn create(&self, module: Module) -> ApiResult<Module>;
    async fn update_fields(
        &self,
        name: &str,
        fields: Vec<ModuleField>,
        field_permissions: Vec<FieldPermission>,
    ) -> ApiResult<Module>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn get(&self, module: &str, id: Uuid) -> ApiResult<Option<Record>>;
    /// Returns the requested page and the total number of matches.
    async fn list(&self, module: &str, query: &ListQuery) -> ApiResult<(Vec<Record>, i64)>;
    async fn exists(&self, module: &str, id: Uuid) -> ApiResult<bool>;
    async fn create(&self, record: Record, events: Vec<OutboxPayload>) -> ApiResult<Record>;
    /// Replaces the data of a record whose version still equals `expected_version`.
    async fn update(
        &self,
        record: Record,
        expected_version: i64,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record>;
    /// Merges `fields` into the stored data in one write, without a version check.
    async fn set_fields(&self, module: &str, id: Uuid, fields: FieldMap) -> ApiResult<Record>;
    async fn update_approval(
        &self,
        module: &str,
        id: Uuid,
        expected_version: i64,
        state: ApprovalRecordState,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record>;
    async fn delete(&self, module: &str, id: Uuid, events: Vec<OutboxPayload>) -> ApiResult<()>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, rule: AutomationRule) -> ApiResult<AutomationRule>;
    async fn get(&self, id: Uuid) -> ApiResult<Option<AutomationRule>>;
    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<AutomationRule>>;
    async fn list(&self) -> ApiResult<Vec<AutomationRule>>;
    async fn update(&self, rule: AutomationRule) -> ApiResult<AutomationRule>;
    async fn delete(&self, id: Uuid) -> ApiResult<()>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow>;
    async fn get(&self, id: Uuid) -> ApiResult<Option<ApprovalWorkflow>>;
    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<ApprovalWorkflow>>;
    async fn update(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow>;
    async fn delete(&self, id: Uuid) -> ApiResult<()>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn insert(&self, entry: AuditLog) -> ApiResult<()>;
    async fn list_for_record(&self, module: &str, record_id: Uuid) -> ApiResult<Vec<AuditLog>>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Moves up to `limit` pending events to `processing` and returns them oldest first.
    async fn claim_pending(&self, limit: i64) -> ApiResult<Vec<OutboxEvent>>;
    async fn mark_processed(&self, id: Uuid) -> ApiResult<()>;
    /// Returns the event to `pending`, or to `dead` once `max_attempts` is reached.
    async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: i32) -> ApiResult<OutboxStatus>;
    /// Hands `processing` events claimed before `cutoff` back to the queue.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> ApiResult<u64>;
    async fn purge_processed(&self, cutoff: DateTime<Utc>) -> ApiResult<u64>;
    async fn pending_count(&self) -> ApiResult<i64>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn get_file(&self, id: Uuid) -> ApiResult<Option<StoredFile>>;
    async fn create_file(&self, file: StoredFile) -> ApiResult<StoredFile>;
}

/// The full set of repositories handed to services
#[derive(Clone)]
pub struct Repositories {
    pub modules: Arc<dyn ModuleRepository>,
    pub records: Arc<dyn RecordRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub audit: Arc<dyn AuditRepository>,
    pub outbox: Arc<dyn OutboxRepository>,
    pub files: Arc<dyn FileRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ModuleRepository
            + RecordRepository
            + RuleRepository
            + WorkflowRepository
            + AuditRepository
            + OutboxRepository
            + FileRepository
            + 'static,
    {
        Self {
            modules: store.clone(),
            records: store.clone(),
            rules: store.clone(),
            workflows: store.clone(),
            audit: store.clone(),
            outbox: store.clone(),
            files: store,
        }
    }
}
