// Automation Actions - Errors and outcomes of individual action runs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::script::ScriptError;
use crate::error::AppError;

/// Why a single action failed. Logged, never returned to the writer of the record.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("script failed: {0}")]
    Script(#[from] ScriptError),

    #[error("data sync failed: {0}")]
    Sync(String),

    #[error("store error: {0}")]
    Store(#[from] AppError),

    #[error("template error: {0}")]
    Template(String),
}

impl From<reqwest::Error> for ActionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Outcome of one action inside a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_type: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(action_type: &str, output: Option<serde_json::Value>) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(action_type: &str, error: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: false,
            output: None,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
