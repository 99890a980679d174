// Automation Engine
//
// Event-driven rules for the CRM: a record create or update is matched against
// the module's rules, and each matching rule runs its actions.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod script;
pub mod templates;
pub mod triggers;

pub use actions::{ActionError, ActionResult};
pub use engine::{AutomationEngine, RuleExecution, RuleInput};
pub use executor::{ActionExecutor, AUTOMATION_ACTOR};
pub use script::{RepositoryHost, ScriptError, ScriptHost, ScriptSandbox};
pub use triggers::TriggerEvent;
