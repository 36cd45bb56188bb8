use serde::{Deserialize, Serialize};
use surrealdb::opt::PatchOp;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Active,
    Inactive,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Auto,
    Manual,
    Mixed,
}

stored_object!(Chat, "chat", {
    kb_id: String,
    external_user_id: i64,
    status: ChatStatus,
    mode: ChatMode,
    #[serde(default)]
    participant_admin_ids: Vec<String>,
    message_count: u32,
});

impl Chat {
    pub fn new(kb_id: String, external_user_id: i64, mode: ChatMode) -> Self {
        let now = chrono::Utc::now();
        Chat {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kb_id,
            external_user_id,
            status: ChatStatus::Active,
            mode,
            participant_admin_ids: Vec::new(),
            message_count: 0,
        }
    }

    pub async fn get(db: &SurrealDbClient, chat_id: &str) -> Result<Self, AppError> {
        db.get_item(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    pub async fn increment_message_count(
        db: &SurrealDbClient,
        chat_id: &str,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query("UPDATE type::thing('chat', $id) SET message_count += 1 RETURN AFTER")
            .bind(("id", chat_id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    pub async fn switch_mode(
        db: &SurrealDbClient,
        chat_id: &str,
        mode: ChatMode,
    ) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((Chat::table_name(), chat_id))
            .patch(PatchOp::replace("/mode", mode))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    pub async fn add_admin(db: &SurrealDbClient, chat_id: &str, admin_id: &str) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('chat', $id) \
                 SET participant_admin_ids += $admin WHERE $admin NOT IN participant_admin_ids \
                 RETURN AFTER",
            )
            .bind(("id", chat_id.to_string()))
            .bind(("admin", admin_id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        match updated {
            Some(chat) => Ok(chat),
            None => Self::get(db, chat_id).await,
        }
    }

    pub async fn remove_admin(
        db: &SurrealDbClient,
        chat_id: &str,
        admin_id: &str,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('chat', $id) \
                 SET participant_admin_ids -= $admin \
                 RETURN AFTER",
            )
            .bind(("id", chat_id.to_string()))
            .bind(("admin", admin_id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    /// CAS transition `active -> inactive` (spec.md §4.5 idle-timeout). A no-op
    /// (not an error) if the chat already moved on to some other status, the
    /// same "races just miss" shape `KnowledgeBase::transition_to_training` uses.
    pub async fn mark_inactive(db: &SurrealDbClient, chat_id: &str) -> Result<Option<Self>, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('chat', $id) \
                 SET status = 'inactive' \
                 WHERE status = 'active' \
                 RETURN AFTER",
            )
            .bind(("id", chat_id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        Ok(updated)
    }

    pub async fn soft_delete(db: &SurrealDbClient, chat_id: &str) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((Chat::table_name(), chat_id))
            .patch(PatchOp::replace("/status", ChatStatus::Deleted))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    pub async fn restore(db: &SurrealDbClient, chat_id: &str) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((Chat::table_name(), chat_id))
            .patch(PatchOp::replace("/status", ChatStatus::Active))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }
}
