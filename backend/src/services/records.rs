// Record Orchestrator - CRUD for module records
//
// Create and update run validation, field permissions and approval gating
// synchronously. Automation and webhooks are queued in the outbox in the same
// write as the record and run later by the dispatcher.

use crm_shared::{FieldType, FieldValue, Module, Record, TriggerType, SYSTEM_FIELDS};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::approvals::ApprovalEngine;
use crate::auth::{Actor, FieldMask};
use crate::error::{ApiResult, AppError};
use crate::services::audit::{AuditAction, AuditEntryBuilder, AuditService, ChangeTracker};
use crate::store::{ListQuery, OutboxPayload, Repositories};
use crate::validation::{RawFields, RecordValidator, ValidationMode};

pub const EVENT_CREATED: &str = "record.created";
pub const EVENT_UPDATED: &str = "record.updated";
pub const EVENT_DELETED: &str = "record.deleted";

/// Record as returned to API callers
pub type RecordDocument = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<RecordDocument>,
    pub total: i64,
}

pub struct RecordOrchestrator {
    repos: Repositories,
    validator: RecordValidator,
    approvals: Arc<ApprovalEngine>,
    audit: AuditService,
    outbox_signal: Arc<Notify>,
}

impl RecordOrchestrator {
    pub fn new(
        repos: Repositories,
        validator: RecordValidator,
        approvals: Arc<ApprovalEngine>,
        audit: AuditService,
        outbox_signal: Arc<Notify>,
    ) -> Self {
        Self { repos, validator, approvals, audit, outbox_signal }
    }

    async fn module(&self, name: &str) -> ApiResult<Module> {
        self.repos
            .modules
            .find_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module '{}'", name)))
    }

    async fn load(&self, module: &str, id: Uuid) -> ApiResult<Record> {
        self.repos
            .records
            .get(module, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {}", id)))
    }

    /// Client input without the keys the orchestrator owns
    fn client_fields(input: &RawFields) -> RawFields {
        input
            .iter()
            .filter(|(k, _)| !SYSTEM_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn create_record(&self, module_name: &str, input: &RawFields, actor: &Actor) -> ApiResult<RecordDocument> {
        let module = self.module(module_name).await?;
        let mask = FieldMask::compute(&module, actor);
        let input = Self::client_fields(input);

        mask.check_writable(&input)?;
        let data = self.validator.validate(&module, &input, ValidationMode::Full).await?;

        let mut record = Record::new(&module.name, data, &actor.user_id);
        record.approval = self.approvals.initialize_approval(&module.name, &record).await?;

        let events = vec![
            OutboxPayload::automation(TriggerType::Create, &record),
            OutboxPayload::webhook(EVENT_CREATED, &module.name, JsonValue::Object(record.to_document())),
        ];
        let record = self.repos.records.create(record, events).await?;
        self.outbox_signal.notify_one();

        info!(
            module = %module.name,
            record_id = %record.id,
            pending_approval = record.is_locked(),
            "Record created by {}",
            actor.user_id
        );

        let created: serde_json::Map<String, JsonValue> =
            record.data.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        self.audit
            .log(
                AuditEntryBuilder::new(AuditAction::Create, module.name.clone())
                    .actor(actor.user_id.clone())
                    .record(record.id)
                    .changes_json(JsonValue::Object(created)),
            )
            .await;

        self.present(&module, record, &mask, actor).await
    }

    pub async fn get_record(&self, module_name: &str, id: Uuid, actor: &Actor) -> ApiResult<RecordDocument> {
        let module = self.module(module_name).await?;
        let record = self.load(&module.name, id).await?;
        let mask = FieldMask::compute(&module, actor);
        self.present(&module, record, &mask, actor).await
    }

    pub async fn list_records(
        &self,
        module_name: &str,
        filter: &RawFields,
        mut query: ListQuery,
        actor: &Actor,
    ) -> ApiResult<RecordPage> {
        let module = self.module(module_name).await?;
        let mask = FieldMask::compute(&module, actor);

        // Filtering or sorting on a hidden field would leak its values
        if let Some(hidden) = filter
            .keys()
            .chain(std::iter::once(&query.sort.field))
            .find(|k| !mask.can_read(k))
        {
            return Err(AppError::Forbidden(format!("Field '{}' is not readable", hidden)));
        }
        let sortable = matches!(query.sort.field.as_str(), "created_at" | "updated_at")
            || module.field(&query.sort.field).is_some();
        if !sortable {
            return Err(AppError::BadRequest(format!("Cannot sort by '{}'", query.sort.field)));
        }

        query.filter = RecordValidator::convert_filter(&module, filter)?;
        let (records, total) = self.repos.records.list(&module.name, &query).await?;

        let mut resolver = Resolver::new(actor);
        let mut documents = Vec::with_capacity(records.len());
        for record in records {
            documents.push(self.present_with(&module, record, &mask, &mut resolver).await?);
        }
        Ok(RecordPage { records: documents, total })
    }

    pub async fn update_record(
        &self,
        module_name: &str,
        id: Uuid,
        input: &RawFields,
        actor: &Actor,
    ) -> ApiResult<RecordDocument> {
        let module = self.module(module_name).await?;
        let current = self.load(&module.name, id).await?;

        if current.is_locked() {
            return Err(AppError::RecordLocked { record_id: id });
        }

        let mask = FieldMask::compute(&module, actor);
        let input = Self::client_fields(input);
        mask.check_writable(&input)?;
        let changes = self.validator.validate(&module, &input, ValidationMode::Partial).await?;

        let mut updated = current.clone();
        updated.data.extend(changes);
        updated.updated_at = chrono::Utc::now();
        let diff = ChangeTracker::diff(&current.data, &updated.data);

        let events = vec![
            OutboxPayload::automation(TriggerType::Update, &updated),
            OutboxPayload::webhook(EVENT_UPDATED, &module.name, JsonValue::Object(updated.to_document())),
        ];
        let record = self.repos.records.update(updated, current.version, events).await?;
        self.outbox_signal.notify_one();

        if diff.has_changes() {
            self.audit
                .log(
                    AuditEntryBuilder::new(AuditAction::Update, module.name.clone())
                        .actor(actor.user_id.clone())
                        .record(id)
                        .changes_json(diff.into_json()),
                )
                .await;
        }

        self.present(&module, record, &mask, actor).await
    }

    pub async fn delete_record(&self, module_name: &str, id: Uuid, actor: &Actor) -> ApiResult<()> {
        let module = self.module(module_name).await?;
        let current = self.load(&module.name, id).await?;

        // Approval is only ever set at creation, so a record that is not
        // locked now cannot become locked before the delete lands.
        if current.is_locked() {
            return Err(AppError::RecordLocked { record_id: id });
        }

        let events = vec![OutboxPayload::webhook(
            EVENT_DELETED,
            &module.name,
            JsonValue::Object(current.to_document()),
        )];
        self.repos.records.delete(&module.name, id, events).await?;
        self.outbox_signal.notify_one();

        info!(module = %module.name, record_id = %id, "Record deleted by {}", actor.user_id);
        self.audit
            .log(
                AuditEntryBuilder::new(AuditAction::Delete, module.name.clone())
                    .actor(actor.user_id.clone())
                    .record(id),
            )
            .await;
        Ok(())
    }

    async fn present(&self, module: &Module, record: Record, mask: &FieldMask, actor: &Actor) -> ApiResult<RecordDocument> {
        self.present_with(module, record, mask, &mut Resolver::new(actor)).await
    }

    /// Strips hidden fields and expands lookups and files into display objects.
    async fn present_with(
        &self,
        module: &Module,
        mut record: Record,
        mask: &FieldMask,
        resolver: &mut Resolver<'_>,
    ) -> ApiResult<RecordDocument> {
        mask.strip_hidden(&mut record.data);
        let mut document = record.to_document();

        for field in &module.fields {
            let Some(value) = record.data.get(&field.name) else {
                continue;
            };
            let resolved = match (field.field_type, value) {
                (FieldType::Lookup, FieldValue::Reference(id)) => {
                    let target = field.lookup.as_ref();
                    let display = match target {
                        Some(lookup) => resolver.lookup(self, &lookup.target_module, &lookup.display_field, id).await?,
                        None => None,
                    };
                    json!({
                        "id": id,
                        "module": target.map(|l| l.target_module.clone()),
                        "display": display,
                    })
                }
                (FieldType::File | FieldType::Image, FieldValue::File(raw)) => resolver.file(self, raw).await?,
                _ => continue,
            };
            document.insert(field.name.clone(), resolved);
        }

        Ok(document)
    }
}

/// Per-request cache of resolved references. Lookup displays go through the
/// actor's field mask on the target module.
struct Resolver<'a> {
    actor: &'a Actor,
    masks: HashMap<String, Option<FieldMask>>,
    lookups: HashMap<(String, String), Option<JsonValue>>,
    files: HashMap<String, JsonValue>,
}

impl<'a> Resolver<'a> {
    fn new(actor: &'a Actor) -> Self {
        Self {
            actor,
            masks: HashMap::new(),
            lookups: HashMap::new(),
            files: HashMap::new(),
        }
    }

    async fn can_read(
        &mut self,
        orchestrator: &RecordOrchestrator,
        module: &str,
        field: &str,
    ) -> ApiResult<bool> {
        if !self.masks.contains_key(module) {
            let mask = orchestrator
                .repos
                .modules
                .find_by_name(module)
                .await?
                .map(|target| FieldMask::compute(&target, self.actor));
            self.masks.insert(module.to_string(), mask);
        }
        Ok(matches!(self.masks.get(module), Some(Some(mask)) if mask.can_read(field)))
    }

    async fn lookup(
        &mut self,
        orchestrator: &RecordOrchestrator,
        module: &str,
        display_field: &str,
        id: &str,
    ) -> ApiResult<Option<JsonValue>> {
        let key = (module.to_string(), id.to_string());
        if let Some(cached) = self.lookups.get(&key) {
            return Ok(cached.clone());
        }

        if !self.can_read(orchestrator, module, display_field).await? {
            self.lookups.insert(key, None);
            return Ok(None);
        }

        let display = match Uuid::parse_str(id) {
            Ok(uuid) => orchestrator
                .repos
                .records
                .get(module, uuid)
                .await?
                .and_then(|target| target.field_value(display_field))
                .map(|v| v.to_json()),
            Err(_) => None,
        };
        self.lookups.insert(key, display.clone());
        Ok(display)
    }

    async fn file(&mut self, orchestrator: &RecordOrchestrator, raw: &str) -> ApiResult<JsonValue> {
        if let Some(cached) = self.files.get(raw) {
            return Ok(cached.clone());
        }

        let resolved = match Uuid::parse_str(raw) {
            Ok(id) => match orchestrator.repos.files.get_file(id).await? {
                Some(file) => json!({
                    "id": file.id,
                    "filename": file.filename,
                    "content_type": file.content_type,
                    "size_bytes": file.size_bytes,
                    "url": file.url,
                }),
                None => json!({ "id": raw, "url": JsonValue::Null }),
            },
            Err(_) => json!({ "url": raw }),
        };
        self.files.insert(raw.to_string(), resolved.clone());
        Ok(resolved)
    }
}
