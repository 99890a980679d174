use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod value;

pub use value::{FieldMap, FieldValue, format_number, json_as_f64, json_display_string};

/// Keys the orchestrator owns on every record. Client input never sets them.
pub const SYSTEM_FIELDS: &[&str] = &["_id", "created_at", "updated_at", "created_by", "owner", "_approval"];

// ============================================
// Modules
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub label: String,
    pub fields: Vec<ModuleField>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub field_permissions: Vec<FieldPermission>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Module {
    pub fn field(&self, name: &str) -> Option<&ModuleField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Textarea,
    Number,
    Boolean,
    Date,
    Email,
    Select,
    MultiSelect,
    Lookup,
    File,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed choices for select / multiSelect. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupConfig>,
}

impl ModuleField {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            label: name.replace('_', " "),
            field_type,
            required: false,
            options: Vec::new(),
            lookup: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_lookup(mut self, target_module: &str, display_field: &str) -> Self {
        self.lookup = Some(LookupConfig {
            target_module: target_module.to_string(),
            display_field: display_field.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupConfig {
    pub target_module: String,
    pub display_field: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldAccess {
    Hidden,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldPermission {
    pub role_id: String,
    pub field: String,
    pub access: FieldAccess,
}

// ============================================
// Records
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub module: String,
    pub data: FieldMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub owner: String,
    #[serde(rename = "_approval", default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecordState>,
    #[serde(default)]
    pub version: i64,
}

impl Record {
    /// A new, unsaved record owned by its creator.
    pub fn new(module: &str, data: FieldMap, created_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            module: module.to_string(),
            data,
            created_at: now,
            updated_at: now,
            created_by: created_by.to_string(),
            owner: created_by.to_string(),
            approval: None,
            version: 0,
        }
    }

    /// Value of a data field or a system field, by name.
    pub fn field_value(&self, name: &str) -> Option<FieldValue> {
        match name {
            "_id" | "id" => Some(FieldValue::Reference(self.id.to_string())),
            "created_at" => Some(FieldValue::DateTime(self.created_at)),
            "updated_at" => Some(FieldValue::DateTime(self.updated_at)),
            "created_by" => Some(FieldValue::Text(self.created_by.clone())),
            "owner" => Some(FieldValue::Text(self.owner.clone())),
            _ => self.data.get(name).cloned(),
        }
    }

    /// A pending approval blocks update and delete.
    pub fn is_locked(&self) -> bool {
        matches!(&self.approval, Some(state) if state.status == ApprovalStatus::Pending)
    }

    /// Natural JSON document: data fields plus system fields.
    pub fn to_document(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut doc: serde_json::Map<String, serde_json::Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        doc.insert("_id".to_string(), serde_json::json!(self.id));
        doc.insert("created_at".to_string(), serde_json::json!(self.created_at.to_rfc3339()));
        doc.insert("updated_at".to_string(), serde_json::json!(self.updated_at.to_rfc3339()));
        doc.insert("created_by".to_string(), serde_json::json!(self.created_by));
        doc.insert("owner".to_string(), serde_json::json!(self.owner));
        if let Some(approval) = &self.approval {
            doc.insert(
                "_approval".to_string(),
                serde_json::to_value(approval).unwrap_or(serde_json::Value::Null),
            );
        }
        doc
    }
}

// ============================================
// Automation rules
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

impl RuleCondition {
    pub fn new(field: &str, operator: ConditionOperator, value: serde_json::Value) -> Self {
        Self { field: field.to_string(), operator, value }
    }

    pub fn equals(field: &str, value: serde_json::Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Create,
    Update,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub module: String,
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// One automation side effect, with the configuration its kind requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum RuleAction {
    SendEmail(SendEmailConfig),
    UpdateField(UpdateFieldConfig),
    Webhook(WebhookConfig),
    CreateTask(CreateTaskConfig),
    RunScript(RunScriptConfig),
    SendNotification(SendNotificationConfig),
    SendSms(SendSmsConfig),
    GeneratePdf(GeneratePdfConfig),
    DataSync(DataSyncConfig),
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "send_email",
            Self::UpdateField(_) => "update_field",
            Self::Webhook(_) => "webhook",
            Self::CreateTask(_) => "create_task",
            Self::RunScript(_) => "run_script",
            Self::SendNotification(_) => "send_notification",
            Self::SendSms(_) => "send_sms",
            Self::GeneratePdf(_) => "generate_pdf",
            Self::DataSync(_) => "data_sync",
        }
    }

    /// Names of required configuration keys that are empty.
    pub fn missing_config(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            Self::SendEmail(c) => {
                if c.to.trim().is_empty() {
                    missing.push("to");
                }
                let has_inline = c.subject.as_deref().is_some_and(|s| !s.is_empty())
                    && c.body.as_deref().is_some_and(|b| !b.is_empty());
                if c.template_id.is_none() && !has_inline {
                    missing.push("template_id|subject+body");
                }
            }
            Self::UpdateField(c) => {
                if c.field.trim().is_empty() {
                    missing.push("field");
                }
            }
            Self::Webhook(c) => {
                if c.url.trim().is_empty() {
                    missing.push("url");
                }
            }
            Self::CreateTask(c) => {
                if c.subject.trim().is_empty() {
                    missing.push("subject");
                }
            }
            Self::RunScript(c) => {
                if c.script.trim().is_empty() {
                    missing.push("script");
                }
            }
            Self::SendNotification(c) => {
                if c.user_id.trim().is_empty() {
                    missing.push("user_id");
                }
                if c.title.trim().is_empty() {
                    missing.push("title");
                }
            }
            Self::SendSms(c) => {
                if c.phone_number.trim().is_empty() {
                    missing.push("phone_number");
                }
                if c.message.trim().is_empty() {
                    missing.push("message");
                }
            }
            Self::GeneratePdf(c) => {
                if c.template.trim().is_empty() {
                    missing.push("template");
                }
            }
            Self::DataSync(c) => {
                if c.sync_setting_id.trim().is_empty() {
                    missing.push("sync_setting_id");
                }
            }
        }
        missing
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SendEmailConfig {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldConfig {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateTaskConfig {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunScriptConfig {
    #[serde(default)]
    pub script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SendNotificationConfig {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SendSmsConfig {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratePdfConfig {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataSyncConfig {
    #[serde(default)]
    pub sync_setting_id: String,
}

// ============================================
// Approval workflows
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalStep {
    pub name: String,
    #[serde(default)]
    pub approver_users: Vec<String>,
    #[serde(default)]
    pub approver_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: Uuid,
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub criteria: Vec<RuleCondition>,
    pub steps: Vec<ApprovalStep>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalHistory {
    pub step_name: String,
    pub actor_id: String,
    pub action: ApprovalAction,
    #[serde(default)]
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRecordState {
    pub status: ApprovalStatus,
    pub current_step: usize,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub history: Vec<ApprovalHistory>,
}

// ============================================
// Audit
// ============================================

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub action: String,
    pub module: String,
    pub record_id: Option<Uuid>,
    pub actor_id: Option<String>,
    pub changes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
