// Automation Triggers - Record events that start rule evaluation

use chrono::{DateTime, Utc};
use crm_shared::{Record, TriggerType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record change that automation rules react to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub trigger_type: TriggerType,
    pub module: String,
    /// Snapshot of the record as it was written
    pub record: Record,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, module: &str, record: Record) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trigger_type,
            module: module.to_string(),
            record,
            timestamp: Utc::now(),
        }
    }

    pub fn created(record: Record) -> Self {
        let module = record.module.clone();
        Self::new(TriggerType::Create, &module, record)
    }

    pub fn updated(record: Record) -> Self {
        let module = record.module.clone();
        Self::new(TriggerType::Update, &module, record)
    }
}
