// Postgres store - records, rules and workflows as JSONB documents

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::{
    ApprovalRecordState, ApprovalStep, ApprovalWorkflow, AuditLog, AutomationRule, FieldMap,
    FieldPermission, FieldValue, Module, ModuleField, Record, RuleAction, RuleCondition, TriggerType,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    AuditRepository, FileRepository, ListQuery, ModuleRepository, OutboxEvent, OutboxPayload,
    OutboxRepository, OutboxStatus, RecordRepository, RuleRepository, StoredFile,
    WorkflowRepository,
};
use crate::error::{ApiResult, AppError};

const RECORD_COLUMNS: &str =
    "id, module, data, approval, created_by, owner, version, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_events(
        tx: &mut Transaction<'_, Postgres>,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<()> {
        for payload in events {
            sqlx::query("INSERT INTO outbox (id, payload, status, created_at) VALUES ($1, $2, 'pending', NOW())")
                .bind(Uuid::new_v4())
                .bind(Json(payload))
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// Tells a version mismatch apart from a missing row after a conditional update.
    async fn conflict_or_missing(&self, module: &str, id: Uuid) -> AppError {
        match RecordRepository::exists(self, module, id).await {
            Ok(true) => AppError::ConcurrentModification { record_id: id },
            Ok(false) => AppError::NotFound(format!("Record {}", id)),
            Err(e) => e,
        }
    }
}

#[derive(FromRow)]
struct ModuleRow {
    name: String,
    label: String,
    fields: Json<Vec<ModuleField>>,
    field_permissions: Json<Vec<FieldPermission>>,
    is_system: bool,
    created_at: DateTime<Utc>,
}

impl From<ModuleRow> for Module {
    fn from(row: ModuleRow) -> Self {
        Module {
            name: row.name,
            label: row.label,
            fields: row.fields.0,
            is_system: row.is_system,
            field_permissions: row.field_permissions.0,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct RecordRow {
    id: Uuid,
    module: String,
    data: Json<FieldMap>,
    approval: Option<Json<ApprovalRecordState>>,
    created_by: String,
    owner: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: row.id,
            module: row.module,
            data: row.data.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            owner: row.owner,
            approval: row.approval.map(|a| a.0),
            version: row.version,
        }
    }
}

#[derive(FromRow)]
struct RuleRow {
    id: Uuid,
    module: String,
    name: String,
    trigger_type: String,
    active: bool,
    conditions: Json<Vec<RuleCondition>>,
    actions: Json<Vec<RuleAction>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for AutomationRule {
    type Error = AppError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let trigger_type: TriggerType = serde_json::from_value(serde_json::Value::String(row.trigger_type))?;
        Ok(AutomationRule {
            id: row.id,
            module: row.module,
            name: row.name,
            trigger_type,
            active: row.active,
            conditions: row.conditions.0,
            actions: row.actions.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct WorkflowRow {
    id: Uuid,
    module: String,
    name: String,
    priority: i32,
    criteria: Json<Vec<RuleCondition>>,
    steps: Json<Vec<ApprovalStep>>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for ApprovalWorkflow {
    fn from(row: WorkflowRow) -> Self {
        ApprovalWorkflow {
            id: row.id,
            module: row.module,
            name: row.name,
            priority: row.priority,
            criteria: row.criteria.0,
            steps: row.steps.0,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OutboxRow {
    id: Uuid,
    payload: Json<OutboxPayload>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        let status = match row.status.as_str() {
            "processing" => OutboxStatus::Processing,
            "processed" => OutboxStatus::Processed,
            "dead" => OutboxStatus::Dead,
            _ => OutboxStatus::Pending,
        };
        OutboxEvent {
            id: row.id,
            payload: row.payload.0,
            status,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            processed_at: row.processed_at,
        }
    }
}

#[async_trait]
impl ModuleRepository for PgStore {
    async fn find_by_name(&self, name: &str) -> ApiResult<Option<Module>> {
        let row = sqlx::query_as::<_, ModuleRow>(
            "SELECT name, label, fields, field_permissions, is_system, created_at FROM modules WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Module::from))
    }

    async fn list(&self) -> ApiResult<Vec<Module>> {
        let rows = sqlx::query_as::<_, ModuleRow>(
            "SELECT name, label, fields, field_permissions, is_system, created_at FROM modules ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Module::from).collect())
    }

    async fn create(&self, module: Module) -> ApiResult<Module> {
        let result = sqlx::query(
            r#"
            INSERT INTO modules (name, label, fields, field_permissions, is_system, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&module.name)
        .bind(&module.label)
        .bind(Json(&module.fields))
        .bind(Json(&module.field_permissions))
        .bind(module.is_system)
        .bind(module.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ConfigConflict(format!("Module '{}' already exists", module.name)));
        }
        Ok(module)
    }

    async fn update_fields(
        &self,
        name: &str,
        fields: Vec<ModuleField>,
        field_permissions: Vec<FieldPermission>,
    ) -> ApiResult<Module> {
        let row = sqlx::query_as::<_, ModuleRow>(
            r#"
            UPDATE modules SET fields = $2, field_permissions = $3
            WHERE name = $1
            RETURNING name, label, fields, field_permissions, is_system, created_at
            "#,
        )
        .bind(name)
        .bind(Json(&fields))
        .bind(Json(&field_permissions))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Module '{}'", name)))?;
        Ok(row.into())
    }
}

/// WHERE clause for a record listing. Filters have the same meaning as in the
/// in-memory store: system keys compare columns, a scalar matches a stored
/// list when the list contains it, and null matches an absent field.
fn push_record_filter(qb: &mut QueryBuilder<'_, Postgres>, module: &str, filter: &FieldMap) -> ApiResult<()> {
    qb.push(" WHERE module = ").push_bind(module.to_string());

    for (key, expected) in filter {
        match key.as_str() {
            "_id" | "id" => {
                qb.push(" AND id::text = ").push_bind(expected.display_string());
            }
            "owner" | "created_by" => {
                qb.push(" AND ")
                    .push(key.as_str())
                    .push(" = ")
                    .push_bind(expected.display_string());
            }
            _ if expected.is_null() => {
                qb.push(" AND COALESCE(data -> ")
                    .push_bind(key.clone())
                    .push(" ->> 'type', 'null') = 'null'");
            }
            _ => {
                let tagged = serde_json::to_value(expected)?;
                qb.push(" AND (data -> ").push_bind(key.clone()).push(" = ").push_bind(tagged.clone());
                if !matches!(expected, FieldValue::List(_)) {
                    qb.push(" OR data -> ")
                        .push_bind(key.clone())
                        .push(" -> 'value' @> jsonb_build_array(")
                        .push_bind(tagged)
                        .push(")");
                }
                qb.push(")");
            }
        }
    }
    Ok(())
}

fn push_record_order(qb: &mut QueryBuilder<'_, Postgres>, field: &str, descending: bool) {
    let direction = if descending { "DESC" } else { "ASC" };
    match field {
        "created_at" | "updated_at" => {
            qb.push(format!(" ORDER BY {} {}", field, direction));
        }
        _ => {
            qb.push(" ORDER BY data -> ")
                .push_bind(field.to_string())
                .push(format!(" -> 'value' {} NULLS LAST, created_at DESC", direction));
        }
    }
}

#[async_trait]
impl RecordRepository for PgStore {
    async fn get(&self, module: &str, id: Uuid) -> ApiResult<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM records WHERE module = $1 AND id = $2",
            RECORD_COLUMNS
        ))
        .bind(module)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Record::from))
    }

    async fn list(&self, module: &str, query: &ListQuery) -> ApiResult<(Vec<Record>, i64)> {
        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM records", RECORD_COLUMNS));
        push_record_filter(&mut select, module, &query.filter)?;
        push_record_order(&mut select, &query.sort.field, query.sort.descending);
        select.push(" LIMIT ").push_bind(query.limit);
        select.push(" OFFSET ").push_bind(query.offset);

        let rows = select
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM records");
        push_record_filter(&mut count, module, &query.filter)?;
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        Ok((rows.into_iter().map(Record::from).collect(), total))
    }

    async fn exists(&self, module: &str, id: Uuid) -> ApiResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM records WHERE module = $1 AND id = $2)",
        )
        .bind(module)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn create(&self, record: Record, events: Vec<OutboxPayload>) -> ApiResult<Record> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            INSERT INTO records (id, module, data, approval, created_by, owner, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.module)
        .bind(Json(&record.data))
        .bind(record.approval.as_ref().map(Json))
        .bind(&record.created_by)
        .bind(&record.owner)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        Self::write_events(&mut tx, events).await?;
        tx.commit().await?;

        Ok(row.into())
    }

    async fn update(
        &self,
        record: Record,
        expected_version: i64,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            UPDATE records
            SET data = $3, owner = $4, version = version + 1, updated_at = NOW()
            WHERE module = $1 AND id = $2 AND version = $5
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(&record.module)
        .bind(record.id)
        .bind(Json(&record.data))
        .bind(&record.owner)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.conflict_or_missing(&record.module, record.id).await);
        };

        Self::write_events(&mut tx, events).await?;
        tx.commit().await?;

        Ok(row.into())
    }

    async fn set_fields(&self, module: &str, id: Uuid, fields: FieldMap) -> ApiResult<Record> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            UPDATE records
            SET data = data || $3, version = version + 1, updated_at = NOW()
            WHERE module = $1 AND id = $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(module)
        .bind(id)
        .bind(Json(&fields))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Record {}", id)))?;
        Ok(row.into())
    }

    async fn update_approval(
        &self,
        module: &str,
        id: Uuid,
        expected_version: i64,
        state: ApprovalRecordState,
        events: Vec<OutboxPayload>,
    ) -> ApiResult<Record> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            UPDATE records
            SET approval = $3, version = version + 1, updated_at = NOW()
            WHERE module = $1 AND id = $2 AND version = $4
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(module)
        .bind(id)
        .bind(Json(&state))
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.conflict_or_missing(module, id).await);
        };

        Self::write_events(&mut tx, events).await?;
        tx.commit().await?;

        Ok(row.into())
    }

    async fn delete(&self, module: &str, id: Uuid, events: Vec<OutboxPayload>) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM records WHERE module = $1 AND id = $2")
            .bind(module)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!("Record {}", id)));
        }

        Self::write_events(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for PgStore {
    async fn create(&self, rule: AutomationRule) -> ApiResult<AutomationRule> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules
            (id, module, name, trigger_type, active, conditions, actions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.module)
        .bind(&rule.name)
        .bind(rule.trigger_type.as_str())
        .bind(rule.active)
        .bind(Json(&rule.conditions))
        .bind(Json(&rule.actions))
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(rule)
    }

    async fn get(&self, id: Uuid) -> ApiResult<Option<AutomationRule>> {
        sqlx::query_as::<_, RuleRow>("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(AutomationRule::try_from)
            .transpose()
    }

    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<AutomationRule>> {
        sqlx::query_as::<_, RuleRow>("SELECT * FROM automation_rules WHERE module = $1 ORDER BY created_at")
            .bind(module)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AutomationRule::try_from)
            .collect()
    }

    async fn list(&self) -> ApiResult<Vec<AutomationRule>> {
        sqlx::query_as::<_, RuleRow>("SELECT * FROM automation_rules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AutomationRule::try_from)
            .collect()
    }

    async fn update(&self, rule: AutomationRule) -> ApiResult<AutomationRule> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules
            SET name = $2, trigger_type = $3, active = $4, conditions = $5, actions = $6, updated_at = $7,
                module = $8
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.trigger_type.as_str())
        .bind(rule.active)
        .bind(Json(&rule.conditions))
        .bind(Json(&rule.actions))
        .bind(rule.updated_at)
        .bind(&rule.module)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Rule {}", rule.id)));
        }
        Ok(rule)
    }

    async fn delete(&self, id: Uuid) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Rule {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn create(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow> {
        sqlx::query(
            r#"
            INSERT INTO approval_workflows
            (id, module, name, priority, criteria, steps, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.module)
        .bind(&workflow.name)
        .bind(workflow.priority)
        .bind(Json(&workflow.criteria))
        .bind(Json(&workflow.steps))
        .bind(workflow.active)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(workflow)
    }

    async fn get(&self, id: Uuid) -> ApiResult<Option<ApprovalWorkflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM approval_workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApprovalWorkflow::from))
    }

    async fn list_by_module(&self, module: &str) -> ApiResult<Vec<ApprovalWorkflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM approval_workflows WHERE module = $1 ORDER BY priority ASC, created_at ASC",
        )
        .bind(module)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApprovalWorkflow::from).collect())
    }

    async fn update(&self, workflow: ApprovalWorkflow) -> ApiResult<ApprovalWorkflow> {
        let result = sqlx::query(
            r#"
            UPDATE approval_workflows
            SET name = $2, priority = $3, criteria = $4, steps = $5, active = $6, updated_at = $7,
                module = $8
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.priority)
        .bind(Json(&workflow.criteria))
        .bind(Json(&workflow.steps))
        .bind(workflow.active)
        .bind(workflow.updated_at)
        .bind(&workflow.module)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Workflow {}", workflow.id)));
        }
        Ok(workflow)
    }

    async fn delete(&self, id: Uuid) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM approval_workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Workflow {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for PgStore {
    async fn insert(&self, entry: AuditLog) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, action, module, record_id, actor_id, changes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.action)
        .bind(&entry.module)
        .bind(entry.record_id)
        .bind(&entry.actor_id)
        .bind(&entry.changes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_record(&self, module: &str, record_id: Uuid) -> ApiResult<Vec<AuditLog>> {
        let entries = sqlx::query_as::<_, AuditLog>(
            r#"
            SELECT id, action, module, record_id, actor_id, changes, created_at
            FROM audit_logs
            WHERE module = $1 AND record_id = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(module)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl OutboxRepository for PgStore {
    async fn claim_pending(&self, limit: i64) -> ApiResult<Vec<OutboxEvent>> {
        let mut rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            UPDATE outbox SET status = 'processing', claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, status, attempts, last_error, created_at, claimed_at, processed_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order
        rows.sort_by_key(|r| r.created_at);
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_processed(&self, id: Uuid) -> ApiResult<()> {
        sqlx::query("UPDATE outbox SET status = 'processed', processed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: i32) -> ApiResult<OutboxStatus> {
        let status: String = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN attempts + 1 >= $3 THEN 'dead' ELSE 'pending' END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(if status == "dead" { OutboxStatus::Dead } else { OutboxStatus::Pending })
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> ApiResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'pending' WHERE status = 'processing' AND claimed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_processed(&self, cutoff: DateTime<Utc>) -> ApiResult<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE status = 'processed' AND processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> ApiResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl FileRepository for PgStore {
    async fn get_file(&self, id: Uuid) -> ApiResult<Option<StoredFile>> {
        let row = sqlx::query_as::<_, (Uuid, String, String, i64, String, DateTime<Utc>)>(
            "SELECT id, filename, content_type, size_bytes, url, created_at FROM files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredFile {
            id: r.0,
            filename: r.1,
            content_type: r.2,
            size_bytes: r.3,
            url: r.4,
            created_at: r.5,
        }))
    }

    async fn create_file(&self, file: StoredFile) -> ApiResult<StoredFile> {
        sqlx::query(
            r#"
            INSERT INTO files (id, filename, content_type, size_bytes, url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(file.id)
        .bind(&file.filename)
        .bind(&file.content_type)
        .bind(file.size_bytes)
        .bind(&file.url)
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(file)
    }
}
