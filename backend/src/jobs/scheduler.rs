// Job Scheduler - Cron jobs for outbox maintenance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::MaintenanceJobs;
use crate::config::OutboxConfig;
use crate::error::AppError;
use crate::store::OutboxRepository;

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Store error: {0}")]
    StoreError(#[from] AppError),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub retention_days: i64,
    /// Cron expression (with seconds) for the purge job
    pub purge_schedule: String,
    pub requeue_interval_minutes: u32,
    /// Claims older than this are considered abandoned
    pub stale_after_minutes: i64,
}

impl JobConfig {
    pub fn from_outbox(outbox: &OutboxConfig) -> Self {
        Self {
            retention_days: outbox.retention_days,
            ..Self::default()
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            // Daily at 3 AM
            purge_schedule: "0 0 3 * * *".to_string(),
            requeue_interval_minutes: 5,
            stale_after_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: JobStatus,
    pub items_processed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Clone, Default)]
pub struct ExecutionLogs(Arc<RwLock<Vec<JobExecutionLog>>>);

impl ExecutionLogs {
    async fn record(&self, job_name: &str, started_at: DateTime<Utc>, outcome: &JobResult<u64>) {
        let log = JobExecutionLog {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at: Utc::now(),
            status: if outcome.is_ok() { JobStatus::Completed } else { JobStatus::Failed },
            items_processed: *outcome.as_ref().unwrap_or(&0),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };

        let mut logs = self.0.write().await;
        logs.push(log);
        if logs.len() > MAX_EXECUTION_LOGS {
            logs.remove(0);
        }
    }

    /// Most recent runs first
    pub async fn recent(&self, limit: usize) -> Vec<JobExecutionLog> {
        self.0.read().await.iter().rev().take(limit).cloned().collect()
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    outbox: Arc<dyn OutboxRepository>,
    config: JobConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(outbox: Arc<dyn OutboxRepository>, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            outbox,
            config,
            execution_logs: ExecutionLogs::default(),
        })
    }

    pub fn execution_logs(&self) -> ExecutionLogs {
        self.execution_logs.clone()
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_outbox_purge().await?;
        self.schedule_stale_requeue().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_outbox_purge(&self) -> JobResult<()> {
        let outbox = self.outbox.clone();
        let retention_days = self.config.retention_days;
        let logs = self.execution_logs.clone();

        let job = Job::new_async(self.config.purge_schedule.as_str(), move |_uuid, _lock| {
            let outbox = outbox.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let outcome = MaintenanceJobs::purge_processed_events(outbox.as_ref(), retention_days).await;
                if let Err(e) = &outcome {
                    error!("Outbox purge failed: {}", e);
                }
                logs.record("Outbox Purge", started_at, &outcome).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(
            "Scheduled outbox purge ({}), keeping {} days",
            self.config.purge_schedule, retention_days
        );

        Ok(())
    }

    async fn schedule_stale_requeue(&self) -> JobResult<()> {
        let interval = self.config.requeue_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval); // Every N minutes

        let outbox = self.outbox.clone();
        let stale_after = self.config.stale_after_minutes;
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let outbox = outbox.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let outcome = MaintenanceJobs::requeue_stale_events(outbox.as_ref(), stale_after).await;
                if let Err(e) = &outcome {
                    error!("Stale outbox requeue failed: {}", e);
                }
                logs.record("Stale Requeue", started_at, &outcome).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled stale outbox requeue to run every {} minutes", interval);

        Ok(())
    }
}
