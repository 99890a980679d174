// Action Executor - Runs the actions of a matched rule
//
// Actions run in list order. Each one is independent: a failure is logged and
// recorded in its `ActionResult`, and the next action still runs.

use chrono::Utc;
use crm_shared::{
    CreateTaskConfig, DataSyncConfig, FieldMap, FieldValue, GeneratePdfConfig, Record, RuleAction,
    RunScriptConfig, SendEmailConfig, SendNotificationConfig, SendSmsConfig, UpdateFieldConfig,
    WebhookConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::script::ScriptSandbox;
use super::templates::{render, render_json};
use super::{ActionError, ActionResult};
use crate::error::AppError;
use crate::services::email::{EmailTemplateService, Mailer};
use crate::services::sync::SyncService;
use crate::services::system_modules::{NOTIFICATIONS, TASKS};
use crate::store::{ModuleRepository, RecordRepository, Repositories};
use crate::validation::{convert, RawFields, RecordValidator, ValidationMode};

/// `created_by` of records written by automation
pub const AUTOMATION_ACTOR: &str = "system:automation";

type ActionOutput = Result<Option<serde_json::Value>, ActionError>;

pub struct ActionExecutor {
    modules: Arc<dyn ModuleRepository>,
    records: Arc<dyn RecordRepository>,
    mailer: Arc<dyn Mailer>,
    templates: EmailTemplateService,
    sync: Arc<dyn SyncService>,
    scripts: ScriptSandbox,
    http: reqwest::Client,
}

impl ActionExecutor {
    pub fn new(
        repos: &Repositories,
        mailer: Arc<dyn Mailer>,
        sync: Arc<dyn SyncService>,
        scripts: ScriptSandbox,
        http_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            modules: repos.modules.clone(),
            records: repos.records.clone(),
            mailer,
            templates: EmailTemplateService::new(repos.records.clone()),
            sync,
            scripts,
            http,
        }
    }

    /// Execute every action against `record`, never stopping early.
    pub async fn execute_actions(&self, actions: &[RuleAction], module: &str, record: &Record) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.execute_action(action, module, record).await);
        }
        results
    }

    /// Execute a single action
    pub async fn execute_action(&self, action: &RuleAction, module: &str, record: &Record) -> ActionResult {
        let start = Instant::now();
        let kind = action.kind();

        info!(action = kind, module = %module, record_id = %record.id, "Executing action");

        let result = match action.missing_config().as_slice() {
            [] => self.dispatch(action, module, record).await,
            missing => Err(ActionError::MissingConfig(missing.join(", "))),
        };

        let duration = start.elapsed().as_millis() as i64;

        match result {
            Ok(output) => ActionResult::success(kind, output).with_duration(duration),
            Err(e) => {
                error!(
                    action = kind,
                    module = %module,
                    record_id = %record.id,
                    "Action failed: {}",
                    e
                );
                ActionResult::failure(kind, &e.to_string()).with_duration(duration)
            }
        }
    }

    async fn dispatch(&self, action: &RuleAction, module: &str, record: &Record) -> ActionOutput {
        match action {
            RuleAction::SendEmail(config) => self.execute_send_email(config, record).await,
            RuleAction::UpdateField(config) => self.execute_update_field(config, module, record).await,
            RuleAction::Webhook(config) => self.execute_webhook(config, module, record).await,
            RuleAction::CreateTask(config) => self.execute_create_task(config, module, record).await,
            RuleAction::RunScript(config) => self.execute_run_script(config, record).await,
            RuleAction::SendNotification(config) => {
                self.execute_send_notification(config, module, record).await
            }
            RuleAction::SendSms(config) => self.execute_send_sms(config, record),
            RuleAction::GeneratePdf(config) => self.execute_generate_pdf(config, module, record),
            RuleAction::DataSync(config) => self.execute_data_sync(config).await,
        }
    }

    // ===== Action Implementations =====

    async fn execute_send_email(&self, config: &SendEmailConfig, record: &Record) -> ActionOutput {
        let to = render(&config.to, record);

        let (subject, body) = match config.template_id {
            Some(template_id) => {
                let rendered = self
                    .templates
                    .render_template(template_id, record)
                    .await
                    .map_err(|e| ActionError::Template(e.to_string()))?;
                (rendered.subject, rendered.body)
            }
            None => (
                render(config.subject.as_deref().unwrap_or_default(), record),
                render(config.body.as_deref().unwrap_or_default(), record),
            ),
        };

        self.mailer
            .send_email(&to, &subject, &body)
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;

        Ok(Some(json!({
            "sent_to": to,
            "subject": subject
        })))
    }

    /// Writes straight to the record at automation trust: no permission mask,
    /// no approval lock, no follow-up triggers. Values are typed by the schema
    /// when the field is known.
    async fn execute_update_field(&self, config: &UpdateFieldConfig, module: &str, record: &Record) -> ActionOutput {
        let raw = render_json(&config.value, record);

        let schema = self.modules.find_by_name(module).await?;
        let value = match schema.as_ref().and_then(|m| m.field(&config.field)) {
            Some(_) if raw.is_null() => FieldValue::Null,
            Some(field) => convert::field_value(field, &raw).unwrap_or_else(|e| {
                warn!(field = %config.field, "Storing untyped value: {}", e.message);
                convert::untyped(&raw)
            }),
            None => convert::untyped(&raw),
        };

        let mut fields = FieldMap::new();
        fields.insert(config.field.clone(), value);
        let updated = self.records.set_fields(module, record.id, fields).await?;

        Ok(Some(json!({
            "record_id": updated.id,
            "field": config.field,
            "value": updated.data.get(&config.field).map(FieldValue::to_json),
        })))
    }

    async fn execute_webhook(&self, config: &WebhookConfig, module: &str, record: &Record) -> ActionOutput {
        let url = render(&config.url, record);
        let method_name = config.method.as_deref().unwrap_or("POST").to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ActionError::InvalidConfig(format!("unsupported method '{}'", method_name)))?;

        let envelope = json!({
            "module": module,
            "record": record.to_document(),
            "timestamp": Utc::now().to_rfc3339(),
        });

        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), render(value, record));
        }
        if method != reqwest::Method::GET {
            request = request.json(&envelope);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ActionError::Status { url, status });
        }

        Ok(Some(json!({
            "url": url,
            "status_code": status
        })))
    }

    async fn execute_create_task(&self, config: &CreateTaskConfig, module: &str, record: &Record) -> ActionOutput {
        let mut raw = RawFields::new();
        raw.insert("subject".into(), json!(render(&config.subject, record)));
        let optional = [
            ("description", &config.description),
            ("assigned_to", &config.assigned_to),
            ("due_date", &config.due_date),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                raw.insert(key.into(), json!(render(value, record)));
            }
        }
        raw.insert("status".into(), json!("open"));
        raw.insert("related_module".into(), json!(module));
        raw.insert("related_record".into(), json!(record.id.to_string()));

        let task = self.create_system_record(TASKS, &raw).await?;
        Ok(Some(json!({ "task_id": task.id })))
    }

    async fn execute_send_notification(
        &self,
        config: &SendNotificationConfig,
        module: &str,
        record: &Record,
    ) -> ActionOutput {
        let mut raw = RawFields::new();
        raw.insert("user_id".into(), json!(render(&config.user_id, record)));
        raw.insert("title".into(), json!(render(&config.title, record)));
        raw.insert("message".into(), json!(render(&config.message, record)));
        raw.insert("read".into(), json!(false));
        raw.insert("related_module".into(), json!(module));
        raw.insert("related_record".into(), json!(record.id.to_string()));

        let notification = self.create_system_record(NOTIFICATIONS, &raw).await?;
        Ok(Some(json!({
            "notification_id": notification.id,
            "user_id": raw.get("user_id"),
        })))
    }

    fn execute_send_sms(&self, config: &SendSmsConfig, record: &Record) -> ActionOutput {
        let message = render(&config.message, record);
        // No SMS transport is wired in; the message is only logged
        info!(phone_number = %config.phone_number, "SMS queued: {}", message);
        Ok(Some(json!({
            "phone_number": config.phone_number,
            "message": message,
            "delivered": false
        })))
    }

    fn execute_generate_pdf(&self, config: &GeneratePdfConfig, module: &str, record: &Record) -> ActionOutput {
        let filename = config
            .filename
            .as_deref()
            .map(|f| render(f, record))
            .unwrap_or_else(|| format!("{}-{}.pdf", module, record.id));
        info!(template = %config.template, filename = %filename, "PDF generation requested");
        Ok(Some(json!({
            "template": config.template,
            "filename": filename,
            "generated": false
        })))
    }

    async fn execute_data_sync(&self, config: &DataSyncConfig) -> ActionOutput {
        let report = self
            .sync
            .run_sync(&config.sync_setting_id)
            .await
            .map_err(|e| ActionError::Sync(e.to_string()))?;
        Ok(Some(serde_json::to_value(report).map_err(AppError::from)?))
    }

    async fn execute_run_script(&self, config: &RunScriptConfig, record: &Record) -> ActionOutput {
        let output = self.scripts.run(&config.script, record).await?;
        Ok(Some(json!({ "result": output })))
    }

    async fn create_system_record(&self, module: &str, raw: &RawFields) -> Result<Record, ActionError> {
        let schema = self
            .modules
            .find_by_name(module)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module '{}'", module)))?;
        let fields = RecordValidator::convert(&schema, raw, ValidationMode::Full)?;
        Ok(self
            .records
            .create(Record::new(module, fields, AUTOMATION_ACTOR), Vec::new())
            .await?)
    }
}
