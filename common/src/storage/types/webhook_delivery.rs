use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

stored_object!(WebhookDelivery, "webhook_delivery", {
    webhook_id: String,
    event_type: String,
    delivery_id: String,
    payload: Value,
    attempt: u32,
    #[serde(default)]
    response_status: Option<u16>,
    #[serde(default)]
    delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    terminal: bool,
});

impl WebhookDelivery {
    pub fn new(webhook_id: String, event_type: String, payload: Value) -> Self {
        let now = chrono::Utc::now();
        WebhookDelivery {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            webhook_id,
            event_type,
            delivery_id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 0,
            response_status: None,
            delivered_at: None,
            next_retry_at: None,
            terminal: false,
        }
    }

    pub async fn get(db: &SurrealDbClient, delivery_id: &str) -> Result<Self, AppError> {
        db.get_item(delivery_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("webhook delivery {delivery_id}")))
    }

    pub async fn record_attempt(
        db: &SurrealDbClient,
        id: &str,
        attempt: u32,
        response_status: Option<u16>,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
        terminal: bool,
    ) -> Result<Self, AppError> {
        let delivered_at = if matches!(response_status, Some(code) if (200..300).contains(&code)) {
            Some(chrono::Utc::now())
        } else {
            None
        };

        let mut res = db
            .client
            .query(
                "UPDATE type::thing('webhook_delivery', $id) \
                 SET attempt = $attempt, response_status = $status, \
                     next_retry_at = $next_retry, terminal = $terminal, \
                     delivered_at = $delivered_at \
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("attempt", attempt))
            .bind(("status", response_status))
            .bind(("next_retry", next_retry_at.map(surrealdb::sql::Datetime::from)))
            .bind(("terminal", terminal))
            .bind(("delivered_at", delivered_at.map(surrealdb::sql::Datetime::from)))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("webhook delivery {id}")))
    }
}
