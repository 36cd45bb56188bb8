use serde::{Deserialize, Serialize};
use surrealdb::opt::PatchOp;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::{kb_membership::KbMembership, StoredObject},
    stored_object,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Init,
    Queued,
    Training,
    Ready,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LlmConfig {
    pub embedding_provider: String,
    pub embedding_model: String,
    pub chat_provider: String,
    pub chat_model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

stored_object!(KnowledgeBase, "knowledge_base", {
    owner_user_id: String,
    name: String,
    domain: String,
    #[serde(default)]
    example_queries: Vec<String>,
    #[serde(default)]
    entity_types: Vec<String>,
    llm_config: LlmConfig,
    training_status: TrainingStatus,
    training_progress: u8,
    processed_docs: u32,
    total_docs: u32,
    #[serde(default)]
    error_message: Option<String>,
});

impl KnowledgeBase {
    pub fn new(owner_user_id: String, name: String, domain: String, llm_config: LlmConfig) -> Self {
        let now = chrono::Utc::now();
        KnowledgeBase {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            owner_user_id,
            name,
            domain,
            example_queries: Vec::new(),
            entity_types: Vec::new(),
            llm_config,
            training_status: TrainingStatus::Init,
            training_progress: 0,
            processed_docs: 0,
            total_docs: 0,
            error_message: None,
        }
    }

    pub async fn create_with_owner(
        db: &SurrealDbClient,
        owner_user_id: String,
        name: String,
        domain: String,
        llm_config: LlmConfig,
    ) -> Result<Self, AppError> {
        let kb = KnowledgeBase::new(owner_user_id.clone(), name, domain, llm_config);
        let stored: Option<Self> = db.store_item(kb).await?;
        let kb = stored.ok_or_else(|| AppError::internal("failed to create knowledge base"))?;
        KbMembership::create_owner(db, &kb.id, &owner_user_id).await?;
        Ok(kb)
    }

    /// `train()`: requires editor+ at the call site (checked by the caller via
    /// `KbMembership::require_permission`). Uses an optimistic `WHERE training_status =
    /// $expected` guard so two racing calls produce exactly one transition to `queued`.
    pub async fn request_training(
        db: &SurrealDbClient,
        kb_id: &str,
    ) -> Result<Self, AppError> {
        let kb = Self::get(db, kb_id).await?;
        if matches!(
            kb.training_status,
            TrainingStatus::Queued | TrainingStatus::Training
        ) {
            return Err(AppError::TrainingInProgress);
        }

        let mut res = db
            .client
            .query(
                "UPDATE type::thing('knowledge_base', $id) \
                 SET training_status = 'queued', error_message = NONE \
                 WHERE training_status = $expected \
                 RETURN AFTER",
            )
            .bind(("id", kb_id.to_string()))
            .bind(("expected", kb.training_status.clone()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or(AppError::TrainingInProgress)
    }

    pub async fn stop_training(db: &SurrealDbClient, kb_id: &str) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((KnowledgeBase::table_name(), kb_id))
            .patch(PatchOp::replace("/training_status", TrainingStatus::Stopped))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("knowledge base {kb_id}")))
    }

    pub async fn transition_to_training(
        db: &SurrealDbClient,
        kb_id: &str,
        total_docs: u32,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('knowledge_base', $id) \
                 SET training_status = 'training', processed_docs = 0, \
                     training_progress = 0, total_docs = $total \
                 WHERE training_status = 'queued' \
                 RETURN AFTER",
            )
            .bind(("id", kb_id.to_string()))
            .bind(("total", total_docs))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::Conflict("knowledge base not in queued state".into()))
    }

    pub async fn record_progress(
        db: &SurrealDbClient,
        kb_id: &str,
        processed_docs: u32,
    ) -> Result<Self, AppError> {
        let kb = Self::get(db, kb_id).await?;
        let progress = if kb.total_docs == 0 {
            0
        } else {
            ((processed_docs as f64 / kb.total_docs as f64) * 100.0).round() as u8
        };
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('knowledge_base', $id) \
                 SET processed_docs = $processed, training_progress = $progress \
                 RETURN AFTER",
            )
            .bind(("id", kb_id.to_string()))
            .bind(("processed", processed_docs))
            .bind(("progress", progress))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("knowledge base {kb_id}")))
    }

    pub async fn mark_ready(db: &SurrealDbClient, kb_id: &str) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('knowledge_base', $id) \
                 SET training_status = 'ready', training_progress = 100 \
                 RETURN AFTER",
            )
            .bind(("id", kb_id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("knowledge base {kb_id}")))
    }

    pub async fn mark_error(
        db: &SurrealDbClient,
        kb_id: &str,
        message: String,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('knowledge_base', $id) \
                 SET training_status = 'error', error_message = $message \
                 RETURN AFTER",
            )
            .bind(("id", kb_id.to_string()))
            .bind(("message", message))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("knowledge base {kb_id}")))
    }

    pub async fn get(db: &SurrealDbClient, kb_id: &str) -> Result<Self, AppError> {
        db.get_item(kb_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge base {kb_id}")))
    }

    /// FIFO candidates for the training coordinator's worker pool: knowledge
    /// bases sitting in `queued`, oldest first. Each candidate still has to win
    /// the `transition_to_training` CAS, so a worker racing another worker (or a
    /// `stop_training` call) for the same id simply moves on to the next one.
    pub async fn list_queued(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query(
                "SELECT * FROM knowledge_base WHERE training_status = 'queued' \
                 ORDER BY updated_at ASC",
            )
            .await?;
        Ok(res.take(0)?)
    }

    /// Deletes the KB and every resource it owns: memberships, documents, chunks,
    /// embeddings, chats (and transitively chat messages), mirroring the cascade the
    /// vector-store entries must also follow (left to the caller's vector-store client,
    /// since that backend is injected, not owned by `common`).
    pub async fn delete_cascade(db: &SurrealDbClient, kb_id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "DELETE chunk WHERE kb_id = $kb; \
                 DELETE embedding WHERE kb_id = $kb; \
                 DELETE document WHERE kb_id = $kb; \
                 DELETE chat_message WHERE chat_id IN (SELECT VALUE id FROM chat WHERE kb_id = $kb); \
                 DELETE chat WHERE kb_id = $kb; \
                 DELETE kb_membership WHERE kb_id = $kb; \
                 DELETE type::thing('knowledge_base', $kb_id);",
            )
            .bind(("kb", kb_id.to_string()))
            .bind(("kb_id", kb_id.to_string()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn train_guards_against_double_queue() {
        let db = test_db().await;
        let kb = KnowledgeBase::create_with_owner(
            &db,
            "user-1".into(),
            "kb".into(),
            "general".into(),
            LlmConfig::default(),
        )
        .await
        .expect("create kb");

        KnowledgeBase::request_training(&db, &kb.id)
            .await
            .expect("first train succeeds");
        let err = KnowledgeBase::request_training(&db, &kb.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TrainingInProgress));
    }

    #[tokio::test]
    async fn progress_never_exceeds_total() {
        let db = test_db().await;
        let kb = KnowledgeBase::create_with_owner(
            &db,
            "user-1".into(),
            "kb".into(),
            "general".into(),
            LlmConfig::default(),
        )
        .await
        .expect("create kb");
        KnowledgeBase::request_training(&db, &kb.id).await.unwrap();
        let kb = KnowledgeBase::transition_to_training(&db, &kb.id, 4)
            .await
            .expect("transition");
        let kb = KnowledgeBase::record_progress(&db, &kb.id, 2).await.unwrap();
        assert_eq!(kb.training_progress, 50);
    }
}
