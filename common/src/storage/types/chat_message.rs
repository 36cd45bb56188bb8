use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    ThirdParty,
    Official,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
    Tool,
}

stored_object!(ChatMessage, "chat_message", {
    chat_id: String,
    sender_kind: SenderKind,
    sender_id: String,
    message_type: MessageType,
    content: String,
    #[serde(default)]
    metadata: HashMap<String, Value>,
});

impl ChatMessage {
    pub fn new(
        chat_id: String,
        sender_kind: SenderKind,
        sender_id: String,
        message_type: MessageType,
        content: String,
    ) -> Self {
        let now = chrono::Utc::now();
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chat_id,
            sender_kind,
            sender_id,
            message_type,
            content,
            metadata: HashMap::new(),
        }
    }

    /// Persists a message and bumps the chat's `message_count` in one logical step; the
    /// hub serializes calls to this so persisted order equals delivery order.
    pub async fn persist(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self.clone()).await?;
        crate::storage::types::chat::Chat::increment_message_count(db, &self.chat_id).await?;
        Ok(())
    }

    pub async fn last_n(
        db: &SurrealDbClient,
        chat_id: &str,
        n: u32,
    ) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query(
                "SELECT * FROM chat_message WHERE chat_id = $chat \
                 ORDER BY created_at DESC LIMIT $n",
            )
            .bind(("chat", chat_id.to_string()))
            .bind(("n", n))
            .await?;
        let mut rows: Vec<Self> = res.take(0)?;
        rows.reverse();
        Ok(rows)
    }

    /// Replay support for reconnecting sockets: every message strictly after `since_id`,
    /// in persisted order.
    pub async fn since(
        db: &SurrealDbClient,
        chat_id: &str,
        since_created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query(
                "SELECT * FROM chat_message WHERE chat_id = $chat AND created_at > $since \
                 ORDER BY created_at ASC",
            )
            .bind(("chat", chat_id.to_string()))
            .bind(("since", surrealdb::sql::Datetime::from(since_created_at)))
            .await?;
        Ok(res.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn persisted_order_matches_creation_order() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        crate::storage::types::chat::Chat::new("kb-1".into(), 1, crate::storage::types::chat::ChatMode::Auto)
            .persist_for_test(&db)
            .await;

        for content in ["hello", "world"] {
            let msg = ChatMessage::new(
                "chat-1".into(),
                SenderKind::ThirdParty,
                "user-1".into(),
                MessageType::Text,
                content.into(),
            );
            msg.persist(&db).await.expect("persist");
        }

        let messages = ChatMessage::last_n(&db, "chat-1", 10).await.expect("last_n");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "world");
    }
}

#[cfg(test)]
impl crate::storage::types::chat::Chat {
    async fn persist_for_test(mut self, db: &SurrealDbClient) {
        self.id = "chat-1".to_string();
        db.store_item(self).await.expect("store chat");
    }
}
