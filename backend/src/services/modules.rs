// Module Service - Schema definitions for user-defined modules

use chrono::Utc;
use crm_shared::{FieldPermission, FieldType, Module, ModuleField, SYSTEM_FIELDS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::info;

use crate::auth::Actor;
use crate::error::{ApiResult, AppError, FieldError, ValidationBuilder};
use crate::services::audit::{AuditAction, AuditEntryBuilder, AuditService};
use crate::store::ModuleRepository;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("identifier pattern is valid"));

fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInput {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub fields: Vec<ModuleField>,
    #[serde(default)]
    pub field_permissions: Vec<FieldPermission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleFieldsInput {
    pub fields: Vec<ModuleField>,
    #[serde(default)]
    pub field_permissions: Vec<FieldPermission>,
}

pub struct ModuleService {
    modules: Arc<dyn ModuleRepository>,
    audit: AuditService,
}

impl ModuleService {
    pub fn new(modules: Arc<dyn ModuleRepository>, audit: AuditService) -> Self {
        Self { modules, audit }
    }

    pub async fn list_modules(&self) -> ApiResult<Vec<Module>> {
        self.modules.list().await
    }

    pub async fn get_module(&self, name: &str) -> ApiResult<Module> {
        self.modules
            .find_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module '{}'", name)))
    }

    pub async fn create_module(&self, input: ModuleInput, actor: &Actor) -> ApiResult<Module> {
        require_admin(actor)?;

        let mut errors = ValidationBuilder::new();
        if !is_identifier(&input.name) {
            errors.push(FieldError::invalid_format(
                "name",
                "name must start with a lowercase letter and contain only a-z, 0-9 and _",
            ));
        }
        self.check_fields(&input.name, &input.fields, &input.field_permissions, &mut errors)
            .await?;
        if let Some(err) = errors.build() {
            return Err(err);
        }

        let module = self
            .modules
            .create(Module {
                label: input.label.unwrap_or_else(|| input.name.clone()),
                name: input.name,
                fields: input.fields,
                is_system: false,
                field_permissions: input.field_permissions,
                created_at: Utc::now(),
            })
            .await?;

        info!(module = %module.name, fields = module.fields.len(), "Module created by {}", actor.user_id);
        self.audit_change(&module, actor, "created").await;
        Ok(module)
    }

    /// Replaces the field list and permissions. Records keep any data for
    /// fields that were removed; it is no longer validated or returned typed.
    pub async fn update_fields(&self, name: &str, input: ModuleFieldsInput, actor: &Actor) -> ApiResult<Module> {
        require_admin(actor)?;

        let existing = self.get_module(name).await?;
        if existing.is_system {
            return Err(AppError::Forbidden(format!("Module '{}' is managed by the system", name)));
        }

        let mut errors = ValidationBuilder::new();
        self.check_fields(name, &input.fields, &input.field_permissions, &mut errors)
            .await?;
        if let Some(err) = errors.build() {
            return Err(err);
        }

        let module = self
            .modules
            .update_fields(name, input.fields, input.field_permissions)
            .await?;
        self.audit_change(&module, actor, "fields_updated").await;
        Ok(module)
    }

    async fn check_fields(
        &self,
        module: &str,
        fields: &[ModuleField],
        permissions: &[FieldPermission],
        errors: &mut ValidationBuilder,
    ) -> ApiResult<()> {
        let mut seen = HashSet::new();

        for (i, field) in fields.iter().enumerate() {
            let path = format!("fields[{}]", i);
            if !is_identifier(&field.name) {
                errors.push(FieldError::invalid_format(&path, format!("'{}' is not a valid field name", field.name)));
            } else if SYSTEM_FIELDS.contains(&field.name.as_str()) {
                errors.push(FieldError::invalid_format(&path, format!("'{}' is reserved", field.name)));
            } else if !seen.insert(field.name.as_str()) {
                errors.push(FieldError::invalid_format(&path, format!("duplicate field '{}'", field.name)));
            }

            match (field.field_type, &field.lookup) {
                (FieldType::Lookup, None) => {
                    errors.push(FieldError::missing(&format!("{}.lookup", path)));
                }
                (FieldType::Lookup, Some(lookup)) => {
                    let target_exists = lookup.target_module == module
                        || self.modules.find_by_name(&lookup.target_module).await?.is_some();
                    if !target_exists {
                        errors.push(FieldError::invalid_format(
                            &format!("{}.lookup", path),
                            format!("unknown module '{}'", lookup.target_module),
                        ));
                    }
                }
                _ => {}
            }
        }

        for (i, permission) in permissions.iter().enumerate() {
            if !seen.contains(permission.field.as_str()) {
                errors.push(FieldError::invalid_format(
                    &format!("field_permissions[{}]", i),
                    format!("unknown field '{}'", permission.field),
                ));
            }
        }

        Ok(())
    }

    async fn audit_change(&self, module: &Module, actor: &Actor, change: &str) {
        self.audit
            .log(
                AuditEntryBuilder::new(AuditAction::ModuleChange, module.name.clone())
                    .actor(actor.user_id.clone())
                    .changes_json(serde_json::json!({
                        "change": change,
                        "fields": module.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
                    })),
            )
            .await;
    }
}

pub fn require_admin(actor: &Actor) -> ApiResult<()> {
    if actor.is_admin {
        Ok(())
    } else {
        Err(AppError::Forbidden("Administrator access required".to_string()))
    }
}
