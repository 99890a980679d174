//! Field-level permissions
//!
//! A module lists `(role, field, access)` rules. For each field the actor gets
//! the most permissive access across their roles; a role without a rule for
//! the field counts as `read_write`. Admins see and write everything.

use crm_shared::{FieldAccess, FieldMap, Module};
use std::collections::HashMap;

use super::Actor;
use crate::error::{ApiResult, AppError};
use crate::validation::RawFields;

#[derive(Debug, Clone)]
pub struct FieldMask {
    access: HashMap<String, FieldAccess>,
}

impl FieldMask {
    pub fn compute(module: &Module, actor: &Actor) -> Self {
        let mut access = HashMap::new();

        for field in &module.fields {
            let level = if actor.is_admin {
                FieldAccess::ReadWrite
            } else {
                Self::resolve(module, &field.name, actor)
            };
            access.insert(field.name.clone(), level);
        }

        Self { access }
    }

    fn resolve(module: &Module, field: &str, actor: &Actor) -> FieldAccess {
        // An actor without roles is governed by rules for no role at all
        if actor.role_ids.is_empty() {
            return FieldAccess::ReadWrite;
        }

        actor
            .role_ids
            .iter()
            .map(|role| {
                module
                    .field_permissions
                    .iter()
                    .filter(|p| &p.role_id == role && p.field == field)
                    .map(|p| p.access)
                    .min()
                    .unwrap_or(FieldAccess::ReadWrite)
            })
            .max()
            .unwrap_or(FieldAccess::ReadWrite)
    }

    pub fn access(&self, field: &str) -> FieldAccess {
        self.access.get(field).copied().unwrap_or(FieldAccess::ReadWrite)
    }

    pub fn can_read(&self, field: &str) -> bool {
        self.access(field) != FieldAccess::Hidden
    }

    pub fn can_write(&self, field: &str) -> bool {
        self.access(field) == FieldAccess::ReadWrite
    }

    /// Rejects input that names a field the actor may not write.
    pub fn check_writable(&self, input: &RawFields) -> ApiResult<()> {
        let mut denied: Vec<&str> = input
            .keys()
            .filter(|k| self.access.contains_key(k.as_str()) && !self.can_write(k))
            .map(String::as_str)
            .collect();

        if denied.is_empty() {
            return Ok(());
        }
        denied.sort_unstable();
        Err(AppError::Forbidden(format!(
            "Not allowed to modify field(s): {}",
            denied.join(", ")
        )))
    }

    /// Drops hidden fields from record data.
    pub fn strip_hidden(&self, data: &mut FieldMap) {
        data.retain(|field, _| self.can_read(field));
    }

}
