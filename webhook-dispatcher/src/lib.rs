#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Delivers events to subscribed webhooks at-least-once, signed, with retry
//! (§4.6). Grounded on `Humans-Not-Required-local-agent-chat/src/webhooks.rs`'s
//! HMAC-SHA256 signing and JSON body composition, generalized from that
//! source's fire-and-forget delivery to a persisted retry loop: every attempt
//! is recorded via `WebhookDelivery::record_attempt` so a crash mid-backoff
//! resumes as a `terminal = false` row rather than silently dropping the
//! event.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{webhook::Webhook, webhook_delivery::WebhookDelivery},
    },
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Default per-delivery HTTP timeout (§4.6) when a webhook hasn't overridden it.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How long `publish` waits for a free queue slot before failing with
/// `Overloaded` (§5: "publish blocks briefly then fails with Overloaded").
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

struct DeliveryJob {
    webhook_id: String,
    delivery_id: String,
}

/// Owns the bounded delivery queue and the worker pool draining it. Cheap to
/// clone (`Arc` internally); share one instance between `publish` callers and
/// the background worker loop, the same shape `TrainingCoordinator` uses.
pub struct WebhookDispatcher {
    db: Arc<SurrealDbClient>,
    http: reqwest::Client,
    tx: mpsc::Sender<DeliveryJob>,
    rx: AsyncMutex<mpsc::Receiver<DeliveryJob>>,
    semaphore: Arc<Semaphore>,
    webhook_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl WebhookDispatcher {
    pub fn new(db: Arc<SurrealDbClient>, max_workers: usize, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Arc::new(Self {
            db,
            http: reqwest::Client::new(),
            tx,
            rx: AsyncMutex::new(rx),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            webhook_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    /// `publish(event_type, payload, meta)` (§4.6): composes the wire body once,
    /// fans it out as one `WebhookDelivery` row per subscribed webhook, and
    /// enqueues each for the worker pool. Non-blocking: a full queue fails fast
    /// with `Overloaded` rather than growing unbounded.
    pub async fn publish(&self, event_type: &str, data: Value, metadata: Value) -> Result<(), AppError> {
        let subscribers = Webhook::list_subscribed(&self.db, event_type).await?;
        if subscribers.is_empty() {
            return Ok(());
        }

        let body = json!({
            "event_type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
            "metadata": metadata,
        });

        for webhook in subscribers {
            let delivery = WebhookDelivery::new(webhook.id.clone(), event_type.to_string(), body.clone());
            self.db.store_item(delivery.clone()).await?;

            let job = DeliveryJob {
                webhook_id: webhook.id.clone(),
                delivery_id: delivery.id.clone(),
            };
            match tokio::time::timeout(ENQUEUE_TIMEOUT, self.tx.send(job)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(AppError::internal("webhook dispatcher queue closed")),
                Err(_) => return Err(AppError::Overloaded),
            }
        }
        Ok(())
    }

    async fn lock_for(&self, webhook_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.webhook_locks.lock().await;
        Arc::clone(
            locks
                .entry(webhook_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Runs forever: acquires a worker slot, pulls the next job, and serializes
    /// on the target webhook before attempting delivery so a retry can never
    /// reorder with a newer event to the same endpoint (§5).
    pub async fn run_worker_loop(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let job = {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            };

            match job {
                Some(job) => {
                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        dispatcher.process(job, permit).await;
                    });
                }
                None => return,
            }
        }
    }

    async fn process(&self, job: DeliveryJob, _permit: tokio::sync::OwnedSemaphorePermit) {
        let webhook_lock = self.lock_for(&job.webhook_id).await;
        let _guard = webhook_lock.lock().await;

        let webhook = match Webhook::get(&self.db, &job.webhook_id).await {
            Ok(webhook) => webhook,
            Err(err) => {
                warn!(webhook_id = %job.webhook_id, error = %err, "webhook vanished before delivery");
                return;
            }
        };
        if !webhook.is_active {
            return;
        }

        let delivery = match WebhookDelivery::get(&self.db, &job.delivery_id).await {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(delivery_id = %job.delivery_id, error = %err, "delivery row vanished before send");
                return;
            }
        };

        if let Err(err) = self.deliver_with_retry(&webhook, &delivery).await {
            error!(webhook_id = %webhook.id, delivery_id = %delivery.id, error = %err, "webhook delivery exhausted retries");
        }
    }

    /// Drives one delivery through the policy's backoff schedule (§4.6 step 4),
    /// persisting every attempt. Stops at the first 2xx or once `max_attempts`
    /// is reached, whichever comes first.
    async fn deliver_with_retry(&self, webhook: &Webhook, delivery: &WebhookDelivery) -> Result<(), AppError> {
        let policy = &webhook.retry_policy;
        let base_ms = policy.backoff_base_secs.max(1) * 1000;
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .map(jitter)
            .map(|delay| delay.min(Duration::from_secs(policy.backoff_cap_secs)));

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.attempt_delivery(webhook, delivery).await;

            let (status, error_message) = match outcome {
                Ok(status) => (Some(status), None),
                Err(err) => (None, Some(err.to_string())),
            };

            if let Some(status) = status {
                if (200..300).contains(&status) {
                    WebhookDelivery::record_attempt(&self.db, &delivery.id, attempt, Some(status), None, true).await?;
                    info!(webhook_id = %webhook.id, delivery_id = %delivery.id, attempt, "webhook delivered");
                    return Ok(());
                }
            }

            if attempt >= policy.max_attempts {
                WebhookDelivery::record_attempt(&self.db, &delivery.id, attempt, status, None, true).await?;
                return Err(AppError::ExternalServiceError(error_message.unwrap_or_else(|| {
                    format!("webhook {} failed with status {status:?} after {attempt} attempts", webhook.id)
                })));
            }

            let delay = delays.next().unwrap_or_else(|| Duration::from_secs(policy.backoff_cap_secs));
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(policy.backoff_cap_secs as i64));
            WebhookDelivery::record_attempt(&self.db, &delivery.id, attempt, status, Some(next_retry_at), false).await?;
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_delivery(&self, webhook: &Webhook, delivery: &WebhookDelivery) -> Result<u16, AppError> {
        let body = serde_json::to_vec(&delivery.payload).map_err(|err| AppError::internal(err.to_string()))?;
        let signature = sign(&webhook.secret, &body)?;

        let timeout = if webhook.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            webhook.timeout_secs
        };

        let mut request = self
            .http
            .post(&webhook.url)
            .timeout(Duration::from_secs(timeout))
            .header("Content-Type", "application/json")
            .header("X-Signature", format!("sha256={signature}"))
            .header("X-Event", &delivery.event_type)
            .header("X-Delivery-Id", &delivery.delivery_id);

        for (key, value) in &webhook.custom_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.body(body).send().await?;
        Ok(response.status().as_u16())
    }
}

/// `X-Signature: sha256=<hex>` (§4.6 step 2). HMAC accepts any key length, so
/// the only error path is an implementation bug, not caller input.
fn sign(secret: &str, body: &[u8]) -> Result<String, AppError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| AppError::internal(err.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification a receiver would run on its side of `X-Signature`
/// (§4.6: "specified so receivers can verify"). Not used internally by the
/// dispatcher, which only signs; exposed for the benefit of whatever thin
/// receiver-side adapter validates inbound copies of these payloads in tests.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = sign(secret, body) else {
        return false;
    };
    let expected_bytes = expected.as_bytes();
    let actual_bytes = hex_sig.as_bytes();
    if expected_bytes.len() != actual_bytes.len() {
        return false;
    }
    expected_bytes
        .iter()
        .zip(actual_bytes.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::webhook::Webhook;

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("webhook_dispatcher_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        Arc::new(db)
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let db = test_db().await;
        let dispatcher = WebhookDispatcher::new(Arc::clone(&db), 2, 16);
        dispatcher
            .publish("document.processed", json!({"id": "doc-1"}), json!({}))
            .await
            .expect("publish");
    }

    #[tokio::test]
    async fn publish_enqueues_one_delivery_row_per_subscriber() {
        let db = test_db().await;
        let webhook = Webhook::new(
            "user-1".into(),
            "https://example.com/hook".into(),
            vec!["document.processed".into()],
        )
        .expect("construct webhook");
        db.store_item(webhook.clone()).await.expect("store webhook");

        let dispatcher = WebhookDispatcher::new(Arc::clone(&db), 2, 16);
        dispatcher
            .publish("document.processed", json!({"id": "doc-1"}), json!({}))
            .await
            .expect("publish");

        let deliveries: Vec<WebhookDelivery> = db.get_all_stored_items().await.expect("deliveries");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].webhook_id, webhook.id);
        assert!(!deliveries[0].terminal);
    }

    #[tokio::test]
    async fn publish_skips_webhooks_not_subscribed() {
        let db = test_db().await;
        let webhook = Webhook::new(
            "user-1".into(),
            "https://example.com/hook".into(),
            vec!["chat.started".into()],
        )
        .expect("construct webhook");
        db.store_item(webhook).await.expect("store webhook");

        let dispatcher = WebhookDispatcher::new(Arc::clone(&db), 2, 16);
        dispatcher
            .publish("document.processed", json!({"id": "doc-1"}), json!({}))
            .await
            .expect("publish");

        let deliveries: Vec<WebhookDelivery> = db.get_all_stored_items().await.expect("deliveries");
        assert!(deliveries.is_empty());
    }

    #[test]
    fn signature_round_trips_through_verify() {
        let secret = Webhook::generate_secret();
        let body = b"{\"event_type\":\"document.processed\"}";
        let signature = sign(&secret, body).expect("sign");
        let header = format!("sha256={signature}");
        assert!(verify_signature(&secret, body, &header));
        assert!(!verify_signature(&secret, b"tampered body", &header));
    }
}
