// Maintenance Jobs - Outbox housekeeping

use chrono::{Duration, Utc};
use tracing::info;

use super::JobResult;
use crate::store::OutboxRepository;

pub struct MaintenanceJobs;

impl MaintenanceJobs {
    /// Delete processed outbox events older than `retention_days`.
    pub async fn purge_processed_events(outbox: &dyn OutboxRepository, retention_days: i64) -> JobResult<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let purged = outbox.purge_processed(cutoff).await?;

        if purged > 0 {
            info!(purged, retention_days, "Purged processed outbox events");
        }
        Ok(purged)
    }

    /// Return events whose worker died mid-batch to the queue.
    pub async fn requeue_stale_events(outbox: &dyn OutboxRepository, stale_after_minutes: i64) -> JobResult<u64> {
        let cutoff = Utc::now() - Duration::minutes(stale_after_minutes);
        let requeued = outbox.requeue_stale(cutoff).await?;

        if requeued > 0 {
            info!(requeued, "Requeued stale outbox events");
        }
        Ok(requeued)
    }
}
