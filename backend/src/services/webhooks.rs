// Webhook Service - Fan record events out to subscribed endpoints
//
// Subscriptions are records of the `webhook_subscriptions` module. Deliveries
// run concurrently; a failing endpoint is logged and does not affect the others.

use chrono::Utc;
use crm_shared::{FieldValue, Record};
use futures::future::join_all;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::ApiResult;
use crate::services::system_modules::WEBHOOK_SUBSCRIPTIONS;
use crate::store::{ListQuery, RecordRepository};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Maximum subscriptions considered for one event
const SUBSCRIPTION_LIMIT: i64 = 1_000;

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex>` HMAC of the request body
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub module: String,
    pub data: serde_json::Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub url: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Subscription {
    url: String,
    secret: Option<String>,
}

impl Subscription {
    fn matching(record: &Record, event: &str, module: &str) -> Option<Self> {
        let active = matches!(record.data.get("active"), Some(FieldValue::Bool(true)));
        if !active {
            return None;
        }

        let subscribed = match record.data.get("events") {
            Some(FieldValue::List(events)) => events.iter().any(|e| e.as_str() == Some(event)),
            Some(other) => other.as_str() == Some(event),
            None => false,
        };
        if !subscribed {
            return None;
        }

        let scope = record
            .data
            .get("module")
            .and_then(FieldValue::as_str)
            .unwrap_or("");
        if !scope.is_empty() && scope != module {
            return None;
        }

        let url = record.data.get("url").and_then(FieldValue::as_str)?.to_string();
        let secret = record
            .data
            .get("secret")
            .and_then(FieldValue::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Some(Self { url, secret })
    }
}

#[derive(Clone)]
pub struct WebhookService {
    records: Arc<dyn RecordRepository>,
    client: reqwest::Client,
}

impl WebhookService {
    pub fn new(records: Arc<dyn RecordRepository>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { records, client }
    }

    async fn subscriptions(&self, event: &str, module: &str) -> ApiResult<Vec<Subscription>> {
        let query = ListQuery {
            limit: SUBSCRIPTION_LIMIT,
            ..Default::default()
        };
        let (records, _) = self.records.list(WEBHOOK_SUBSCRIPTIONS, &query).await?;
        Ok(records
            .iter()
            .filter_map(|r| Subscription::matching(r, event, module))
            .collect())
    }

    /// Deliver `event` to every matching subscription. Only loading the
    /// subscriptions can fail; delivery failures are reported per endpoint.
    pub async fn trigger(
        &self,
        event: &str,
        module: &str,
        data: serde_json::Value,
    ) -> ApiResult<Vec<DeliveryResult>> {
        let subscriptions = self.subscriptions(event, module).await?;
        if subscriptions.is_empty() {
            debug!(event = %event, module = %module, "No webhook subscriptions");
            return Ok(Vec::new());
        }

        let payload = WebhookPayload {
            event: event.to_string(),
            module: module.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_vec(&payload)?;

        let deliveries = subscriptions.iter().map(|sub| self.deliver(sub, &body));
        let results = join_all(deliveries).await;

        let delivered = results.iter().filter(|r| r.success).count();
        info!(
            event = %event,
            module = %module,
            delivered,
            failed = results.len() - delivered,
            "Webhook fan-out complete"
        );
        Ok(results)
    }

    async fn deliver(&self, sub: &Subscription, body: &[u8]) -> DeliveryResult {
        let mut request = self
            .client
            .post(&sub.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(signature) = sub.secret.as_deref().and_then(|s| sign(s, body)) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => DeliveryResult {
                url: sub.url.clone(),
                success: true,
                status_code: Some(response.status().as_u16()),
                error: None,
            },
            Ok(response) => {
                let status = response.status().as_u16();
                error!(url = %sub.url, status, "Webhook endpoint rejected delivery");
                DeliveryResult {
                    url: sub.url.clone(),
                    success: false,
                    status_code: Some(status),
                    error: Some(format!("status {}", status)),
                }
            }
            Err(e) => {
                error!(url = %sub.url, "Webhook delivery failed: {}", e);
                DeliveryResult {
                    url: sub.url.clone(),
                    success: false,
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
