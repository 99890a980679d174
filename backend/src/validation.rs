//! Record validation for the CRM API
//!
//! Raw JSON input is converted into typed `FieldValue`s against a module's
//! schema. This is the only place untyped client values become record data.

use crm_shared::{FieldMap, FieldType, FieldValue, Module, ModuleField};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiResult, AppError, FieldError, ValidationBuilder};
use crate::store::{FileRepository, RecordRepository};

/// Raw client input keyed by field name
pub type RawFields = serde_json::Map<String, JsonValue>;

/// Whether absent required fields are an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Create: every required field must be present
    Full,
    /// Update: only fields present in the input are checked
    Partial,
}

/// Blank means absent, null or an empty/whitespace string.
fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Per-type conversions. Pure functions so they can be reused for list filters.
pub mod convert {
    use super::*;

    pub fn text(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        match value {
            JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
            JsonValue::Number(_) | JsonValue::Bool(_) => {
                Ok(FieldValue::Text(crm_shared::json_display_string(value)))
            }
            _ => Err(FieldError::invalid_type(field, "string")),
        }
    }

    pub fn number(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        crm_shared::json_as_f64(value)
            .filter(|n| n.is_finite())
            .map(FieldValue::Number)
            .ok_or_else(|| FieldError::invalid_type(field, "number"))
    }

    pub fn boolean(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        match value {
            JsonValue::Bool(b) => Ok(FieldValue::Bool(*b)),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "f" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(FieldError::invalid_type(field, "boolean")),
            },
            _ => Err(FieldError::invalid_type(field, "boolean")),
        }
    }

    /// RFC 3339 timestamps keep their time; `YYYY-MM-DD` becomes a plain date.
    pub fn date(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        let s = value
            .as_str()
            .ok_or_else(|| FieldError::invalid_type(field, "date string"))?
            .trim();

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return Ok(FieldValue::DateTime(dt.with_timezone(&chrono::Utc)));
        }
        chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(FieldValue::Date)
            .map_err(|_| {
                FieldError::invalid_format(field, format!("{} must be RFC 3339 or YYYY-MM-DD", field))
            })
    }

    pub fn email(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        let s = value
            .as_str()
            .ok_or_else(|| FieldError::invalid_type(field, "string"))?
            .trim();

        if is_valid_email(s) {
            Ok(FieldValue::Email(s.to_string()))
        } else {
            Err(FieldError::invalid_format(field, "Invalid email format"))
        }
    }

    /// local@domain.tld with no whitespace and a dotted domain
    pub fn is_valid_email(s: &str) -> bool {
        if s.chars().any(char::is_whitespace) {
            return false;
        }
        let parts: Vec<&str> = s.split('@').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return false;
        }
        let domain = parts[1];
        let labels: Vec<&str> = domain.split('.').collect();
        labels.len() >= 2
            && labels.iter().all(|l| !l.is_empty())
            && labels.last().is_some_and(|tld| tld.len() >= 2 && tld.chars().all(char::is_alphabetic))
    }

    pub fn select(value: &JsonValue, field: &ModuleField) -> Result<FieldValue, FieldError> {
        let s = value
            .as_str()
            .ok_or_else(|| FieldError::invalid_type(&field.name, "string"))?;
        check_option(s, field)?;
        Ok(FieldValue::Text(s.to_string()))
    }

    /// A single string is accepted as a one-element selection.
    pub fn multi_select(value: &JsonValue, field: &ModuleField) -> Result<FieldValue, FieldError> {
        let items: Vec<&JsonValue> = match value {
            JsonValue::Array(items) => items.iter().collect(),
            JsonValue::String(_) => vec![value],
            _ => return Err(FieldError::invalid_type(&field.name, "list of strings")),
        };

        let mut selected = Vec::with_capacity(items.len());
        for item in items {
            let s = item
                .as_str()
                .ok_or_else(|| FieldError::invalid_type(&field.name, "list of strings"))?;
            check_option(s, field)?;
            selected.push(FieldValue::Text(s.to_string()));
        }
        Ok(FieldValue::List(selected))
    }

    fn check_option(s: &str, field: &ModuleField) -> Result<(), FieldError> {
        if field.options.is_empty() || field.options.iter().any(|o| o == s) {
            Ok(())
        } else {
            Err(FieldError::invalid_format(
                &field.name,
                format!("'{}' is not one of: {}", s, field.options.join(", ")),
            ))
        }
    }

    /// Reference ids are record UUIDs. Resolved lookup objects (`{"id": ...}`)
    /// are accepted so read output can be sent back unchanged.
    pub fn reference(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        let raw = match value {
            JsonValue::String(s) => s.trim(),
            JsonValue::Object(obj) => obj
                .get("id")
                .or_else(|| obj.get("_id"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| FieldError::invalid_type(field, "reference id"))?,
            _ => return Err(FieldError::invalid_type(field, "reference id")),
        };

        Uuid::parse_str(raw)
            .map(|id| FieldValue::Reference(id.to_string()))
            .map_err(|_| FieldError::invalid_format(field, format!("{} must be a record id", field)))
    }

    /// A stored file id or an absolute http(s) URL.
    pub fn file(value: &JsonValue, field: &str) -> Result<FieldValue, FieldError> {
        let raw = match value {
            JsonValue::String(s) => s.trim(),
            JsonValue::Object(obj) => obj
                .get("id")
                .or_else(|| obj.get("url"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| FieldError::invalid_type(field, "file id or URL"))?,
            _ => return Err(FieldError::invalid_type(field, "file id or URL")),
        };

        if let Ok(id) = Uuid::parse_str(raw) {
            return Ok(FieldValue::File(id.to_string()));
        }
        match url::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(FieldValue::File(raw.to_string())),
            _ => Err(FieldError::invalid_format(field, format!("{} must be a file id or URL", field))),
        }
    }

    /// Best-effort conversion for values with no schema field to guide them.
    pub fn untyped(value: &JsonValue) -> FieldValue {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
            JsonValue::String(s) => FieldValue::Text(s.clone()),
            JsonValue::Array(items) => FieldValue::List(items.iter().map(untyped).collect()),
            JsonValue::Object(_) => FieldValue::Text(value.to_string()),
        }
    }

    /// Converts one non-blank raw value according to the field's type.
    pub fn field_value(field: &ModuleField, value: &JsonValue) -> Result<FieldValue, FieldError> {
        match field.field_type {
            FieldType::Text | FieldType::Textarea => text(value, &field.name),
            FieldType::Number => number(value, &field.name),
            FieldType::Boolean => boolean(value, &field.name),
            FieldType::Date => date(value, &field.name),
            FieldType::Email => email(value, &field.name),
            FieldType::Select => select(value, field),
            FieldType::MultiSelect => multi_select(value, field),
            FieldType::Lookup => reference(value, &field.name),
            FieldType::File | FieldType::Image => file(value, &field.name),
        }
    }
}

/// Schema-driven record validator with referential integrity checks
#[derive(Clone)]
pub struct RecordValidator {
    records: Arc<dyn RecordRepository>,
    files: Arc<dyn FileRepository>,
}

impl RecordValidator {
    pub fn new(records: Arc<dyn RecordRepository>, files: Arc<dyn FileRepository>) -> Self {
        Self { records, files }
    }

    /// Returns a new typed map. Keys outside the schema are dropped; the input
    /// is never modified.
    pub async fn validate(
        &self,
        module: &Module,
        input: &RawFields,
        mode: ValidationMode,
    ) -> ApiResult<FieldMap> {
        let converted = Self::convert(module, input, mode)?;
        self.check_references(module, &converted).await?;
        Ok(converted)
    }

    /// Type conversion only; reports every failing field at once.
    pub fn convert(module: &Module, input: &RawFields, mode: ValidationMode) -> ApiResult<FieldMap> {
        let mut errors = ValidationBuilder::new();
        let mut output = FieldMap::new();

        for field in &module.fields {
            let raw = input.get(&field.name);

            match raw {
                None if mode == ValidationMode::Partial => continue,
                None => {
                    if field.required {
                        errors.push(FieldError::missing(&field.name));
                    }
                }
                Some(value) if is_blank(value) => {
                    if field.required {
                        errors.push(FieldError::missing(&field.name));
                    } else {
                        output.insert(field.name.clone(), FieldValue::Null);
                    }
                }
                Some(value) => match convert::field_value(field, value) {
                    Ok(converted) => {
                        output.insert(field.name.clone(), converted);
                    }
                    Err(e) => errors.push(e),
                },
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }

    async fn check_references(&self, module: &Module, values: &FieldMap) -> ApiResult<()> {
        for field in &module.fields {
            let Some(value) = values.get(&field.name) else {
                continue;
            };

            match (field.field_type, value) {
                (FieldType::Lookup, FieldValue::Reference(id)) => {
                    let Some(lookup) = field.lookup.as_ref().filter(|l| !l.target_module.is_empty()) else {
                        continue;
                    };
                    let found = match Uuid::parse_str(id) {
                        Ok(uuid) => self.records.exists(&lookup.target_module, uuid).await?,
                        Err(_) => false,
                    };
                    if !found {
                        return Err(AppError::DanglingReference {
                            field: field.name.clone(),
                            target: lookup.target_module.clone(),
                            id: id.clone(),
                        });
                    }
                }
                (FieldType::File | FieldType::Image, FieldValue::File(raw)) => {
                    // URLs pass through; only stored file ids are checked
                    let Ok(file_id) = Uuid::parse_str(raw) else {
                        continue;
                    };
                    if self.files.get_file(file_id).await?.is_none() {
                        return Err(AppError::DanglingReference {
                            field: field.name.clone(),
                            target: "files".to_string(),
                            id: raw.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Converts list filter input. Schema fields use their type's conversion;
    /// `_id`, `owner` and `created_by` are also filterable.
    pub fn convert_filter(module: &Module, raw: &RawFields) -> ApiResult<FieldMap> {
        let mut errors = ValidationBuilder::new();
        let mut filter = FieldMap::new();

        for (key, value) in raw {
            let converted = match key.as_str() {
                "_id" => convert::reference(value, key),
                "owner" | "created_by" => convert::text(value, key),
                _ => match module.field(key) {
                    // Filtering a multiSelect by one option matches records containing it
                    Some(field) if field.field_type == FieldType::MultiSelect && value.is_string() => {
                        convert::select(value, field)
                    }
                    Some(field) => convert::field_value(field, value),
                    None => {
                        return Err(AppError::BadRequest(format!(
                            "Unknown filter field '{}' for module '{}'",
                            key, module.name
                        )));
                    }
                },
            };

            match converted {
                Ok(v) => {
                    filter.insert(key.clone(), v);
                }
                Err(e) => errors.push(e),
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(filter),
        }
    }
}
