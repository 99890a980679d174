// Approval Workflows
//
// Multi-step sign-off gating record mutation. A record that enters a workflow
// is locked while its approval is pending; approve advances one step (or
// finishes), reject finishes immediately. Both terminal states are final.

pub mod engine;

pub use engine::{ApprovalEngine, WorkflowInput};
