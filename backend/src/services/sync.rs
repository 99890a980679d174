// Data Sync - Pull records from an external JSON source into a module
//
// A `sync_settings` record names the source URL, the target module, the key
// field used to match existing records, and an optional key mapping.

use async_trait::async_trait;
use crm_shared::{FieldValue, Module, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::system_modules::SYNC_SETTINGS;
use crate::store::{ListQuery, ModuleRepository, RecordRepository};
use crate::validation::{RawFields, RecordValidator, ValidationMode};

const SYNC_ACTOR: &str = "system:sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync setting {0} not found")]
    SettingNotFound(String),
    #[error("invalid sync setting: {0}")]
    InvalidSetting(String),
    #[error("failed to fetch source: {0}")]
    Fetch(String),
    #[error("source returned an unexpected payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Runs a configured data sync to completion
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncService: Send + Sync {
    async fn run_sync(&self, setting_id: &str) -> Result<SyncReport, SyncError>;
}

#[derive(Debug, Clone)]
struct SyncSetting {
    source_url: String,
    target_module: String,
    key_field: String,
    field_map: BTreeMap<String, String>,
}

impl SyncSetting {
    fn from_record(record: &Record) -> Result<Self, SyncError> {
        let text = |name: &str| -> Result<String, SyncError> {
            record
                .data
                .get(name)
                .and_then(FieldValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .ok_or_else(|| SyncError::InvalidSetting(format!("{} is required", name)))
        };

        let field_map = match record.data.get("field_map").and_then(FieldValue::as_str) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| SyncError::InvalidSetting(format!("field_map: {}", e)))?,
            _ => BTreeMap::new(),
        };

        Ok(Self {
            source_url: text("source_url")?,
            target_module: text("target_module")?,
            key_field: text("key_field")?,
            field_map,
        })
    }

    /// Renames source keys; without a mapping the item is taken as-is.
    fn map_item(&self, item: &RawFields) -> RawFields {
        if self.field_map.is_empty() {
            return item.clone();
        }
        self.field_map
            .iter()
            .filter_map(|(source, target)| item.get(source).map(|v| (target.clone(), v.clone())))
            .collect()
    }
}

pub struct HttpSyncService {
    modules: Arc<dyn ModuleRepository>,
    records: Arc<dyn RecordRepository>,
    validator: RecordValidator,
    client: reqwest::Client,
}

impl HttpSyncService {
    pub fn new(
        modules: Arc<dyn ModuleRepository>,
        records: Arc<dyn RecordRepository>,
        validator: RecordValidator,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { modules, records, validator, client }
    }

    async fn upsert(
        &self,
        module: &Module,
        setting: &SyncSetting,
        item: RawFields,
    ) -> Result<Outcome, AppError> {
        let Some(key) = item.get(&setting.key_field).cloned() else {
            return Ok(Outcome::Skipped);
        };

        let mut key_filter = RawFields::new();
        key_filter.insert(setting.key_field.clone(), key);
        let query = ListQuery {
            filter: RecordValidator::convert_filter(module, &key_filter)?,
            limit: 1,
            ..Default::default()
        };
        let (existing, _) = self.records.list(&module.name, &query).await?;

        match existing.into_iter().next() {
            Some(record) => {
                let fields = self.validator.validate(module, &item, ValidationMode::Partial).await?;
                self.records.set_fields(&module.name, record.id, fields).await?;
                Ok(Outcome::Updated)
            }
            None => {
                let fields = self.validator.validate(module, &item, ValidationMode::Full).await?;
                self.records
                    .create(Record::new(&module.name, fields, SYNC_ACTOR), Vec::new())
                    .await?;
                Ok(Outcome::Created)
            }
        }
    }
}

enum Outcome {
    Created,
    Updated,
    Skipped,
}

#[async_trait]
impl SyncService for HttpSyncService {
    async fn run_sync(&self, setting_id: &str) -> Result<SyncReport, SyncError> {
        let id = Uuid::parse_str(setting_id.trim())
            .map_err(|_| SyncError::InvalidSetting(format!("'{}' is not a valid id", setting_id)))?;

        let record = self
            .records
            .get(SYNC_SETTINGS, id)
            .await?
            .ok_or_else(|| SyncError::SettingNotFound(setting_id.to_string()))?;
        let setting = SyncSetting::from_record(&record)?;

        let module = self
            .modules
            .find_by_name(&setting.target_module)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidSetting(format!("unknown target module '{}'", setting.target_module))
            })?;

        let payload: serde_json::Value = self
            .client
            .get(&setting.source_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let serde_json::Value::Array(items) = payload else {
            return Err(SyncError::Payload("expected a JSON array".to_string()));
        };

        let mut report = SyncReport::default();
        for item in items {
            let serde_json::Value::Object(item) = item else {
                report.skipped += 1;
                continue;
            };

            match self.upsert(&module, &setting, setting.map_item(&item)).await {
                Ok(Outcome::Created) => report.created += 1,
                Ok(Outcome::Updated) => report.updated += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(setting_id = %id, "Skipping sync item: {}", e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            setting_id = %id,
            module = %module.name,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            "Data sync finished"
        );
        Ok(report)
    }
}
