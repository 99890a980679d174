// Background Jobs
//
// The outbox dispatcher runs automation and webhooks for committed record
// writes. Housekeeping of the outbox table is scheduled with
// tokio-cron-scheduler.

pub mod maintenance;
pub mod outbox;
pub mod scheduler;

pub use maintenance::MaintenanceJobs;
pub use outbox::OutboxDispatcher;
pub use scheduler::{ExecutionLogs, JobConfig, JobError, JobResult, JobScheduler};
