// Outbox Dispatcher - Runs automation and webhooks queued by record writes
//
// Events are claimed in batches. Store failures put the event back with an
// incremented attempt count; action failures are the executor's business and
// never fail an event.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationEngine, TriggerEvent};
use crate::config::OutboxConfig;
use crate::error::ApiResult;
use crate::services::WebhookService;
use crate::store::{OutboxEvent, OutboxPayload, OutboxRepository, OutboxStatus};

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    automation: Arc<AutomationEngine>,
    webhooks: WebhookService,
    signal: Arc<Notify>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        automation: Arc<AutomationEngine>,
        webhooks: WebhookService,
        signal: Arc<Notify>,
        config: OutboxConfig,
    ) -> Self {
        Self { outbox, automation, webhooks, signal, config }
    }

    /// Worker loop. Wakes on every record write and on the poll interval.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox dispatcher started"
        );

        loop {
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.drain().await {
                error!("Outbox dispatch failed: {}", e);
                // Keep a broken store from spinning the loop
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Processes batches until nothing is pending. Returns the number of
    /// events handled, failed ones included.
    pub async fn drain(&self) -> ApiResult<usize> {
        let mut handled = 0;
        loop {
            let batch = self.dispatch_batch().await?;
            if batch == 0 {
                return Ok(handled);
            }
            handled += batch;
        }
    }

    /// Claims one batch and handles it, oldest event first.
    pub async fn dispatch_batch(&self) -> ApiResult<usize> {
        let events = self.outbox.claim_pending(self.config.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }
        debug!(count = events.len(), "Claimed outbox events");

        for event in &events {
            match self.handle(event).await {
                Ok(()) => self.outbox.mark_processed(event.id).await?,
                Err(e) => {
                    let status = self
                        .outbox
                        .mark_failed(event.id, &e.to_string(), self.config.max_attempts)
                        .await?;
                    if status == OutboxStatus::Dead {
                        error!(
                            event_id = %event.id,
                            attempts = event.attempts + 1,
                            "Outbox event {} dead-lettered: {}",
                            event.payload.label(),
                            e
                        );
                    } else {
                        warn!(
                            event_id = %event.id,
                            attempts = event.attempts + 1,
                            "Outbox event {} failed, will retry: {}",
                            event.payload.label(),
                            e
                        );
                    }
                }
            }
        }

        Ok(events.len())
    }

    async fn handle(&self, event: &OutboxEvent) -> ApiResult<()> {
        match &event.payload {
            OutboxPayload::AutomationTrigger { module, trigger, record } => {
                let mut trigger_event = TriggerEvent::new(*trigger, module, record.clone());
                trigger_event.event_id = event.id;
                let executions = self.automation.process_event(&trigger_event).await?;
                debug!(
                    event_id = %event.id,
                    record_id = %record.id,
                    rules = executions.len(),
                    "Automation trigger processed"
                );
            }
            OutboxPayload::Webhook { event: name, module, record } => {
                self.webhooks.trigger(name, module, record.clone()).await?;
            }
        }
        Ok(())
    }
}
