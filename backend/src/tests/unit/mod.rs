mod approvals;
mod executor;
mod orchestrator;
