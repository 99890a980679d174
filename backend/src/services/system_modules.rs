// System Modules - Built-in modules that actions and collaborators write to

use chrono::Utc;
use crm_shared::{FieldType, Module, ModuleField};
use tracing::info;

use crate::error::ApiResult;
use crate::store::ModuleRepository;

pub const TASKS: &str = "tasks";
pub const NOTIFICATIONS: &str = "notifications";
pub const EMAIL_TEMPLATES: &str = "email_templates";
pub const WEBHOOK_SUBSCRIPTIONS: &str = "webhook_subscriptions";
pub const SYNC_SETTINGS: &str = "sync_settings";

fn system(name: &str, label: &str, fields: Vec<ModuleField>) -> Module {
    Module {
        name: name.to_string(),
        label: label.to_string(),
        fields,
        is_system: true,
        field_permissions: Vec::new(),
        created_at: Utc::now(),
    }
}

pub fn definitions() -> Vec<Module> {
    vec![
        system(
            TASKS,
            "Tasks",
            vec![
                ModuleField::new("subject", FieldType::Text).required(),
                ModuleField::new("description", FieldType::Textarea),
                ModuleField::new("assigned_to", FieldType::Text),
                ModuleField::new("due_date", FieldType::Date),
                ModuleField::new("status", FieldType::Select).with_options(&["open", "in_progress", "done"]),
                ModuleField::new("related_module", FieldType::Text),
                ModuleField::new("related_record", FieldType::Text),
            ],
        ),
        system(
            NOTIFICATIONS,
            "Notifications",
            vec![
                ModuleField::new("user_id", FieldType::Text).required(),
                ModuleField::new("title", FieldType::Text).required(),
                ModuleField::new("message", FieldType::Textarea),
                ModuleField::new("read", FieldType::Boolean),
                ModuleField::new("related_module", FieldType::Text),
                ModuleField::new("related_record", FieldType::Text),
            ],
        ),
        system(
            EMAIL_TEMPLATES,
            "Email Templates",
            vec![
                ModuleField::new("name", FieldType::Text).required(),
                ModuleField::new("subject", FieldType::Text).required(),
                ModuleField::new("body", FieldType::Textarea).required(),
            ],
        ),
        system(
            WEBHOOK_SUBSCRIPTIONS,
            "Webhook Subscriptions",
            vec![
                ModuleField::new("url", FieldType::Text).required(),
                ModuleField::new("events", FieldType::MultiSelect).with_options(&[
                    "record.created",
                    "record.updated",
                    "record.deleted",
                    "record.approved",
                    "record.rejected",
                ]),
                ModuleField::new("module", FieldType::Text),
                ModuleField::new("secret", FieldType::Text),
                ModuleField::new("active", FieldType::Boolean),
            ],
        ),
        system(
            SYNC_SETTINGS,
            "Sync Settings",
            vec![
                ModuleField::new("name", FieldType::Text).required(),
                ModuleField::new("source_url", FieldType::Text).required(),
                ModuleField::new("target_module", FieldType::Text).required(),
                ModuleField::new("key_field", FieldType::Text).required(),
                // JSON object mapping source keys to target field names
                ModuleField::new("field_map", FieldType::Textarea),
            ],
        ),
    ]
}

/// Creates any missing system module. Existing definitions are left alone.
pub async fn seed(modules: &dyn ModuleRepository) -> ApiResult<usize> {
    let mut created = 0;
    for module in definitions() {
        if modules.find_by_name(&module.name).await?.is_some() {
            continue;
        }
        info!("Seeding system module '{}'", module.name);
        modules.create(module).await?;
        created += 1;
    }
    Ok(created)
}
