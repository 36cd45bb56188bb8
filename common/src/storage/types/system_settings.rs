use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

stored_object!(SystemSettings, "system_settings", {
    registrations_enabled: bool,
    require_email_verification: bool,
    default_chat_model: String,
    default_embedding_model: String,
    default_embedding_dimensions: u32,
});

impl SystemSettings {
    fn defaults() -> Self {
        let now = chrono::Utc::now();
        SystemSettings {
            id: "current".to_string(),
            created_at: now,
            updated_at: now,
            registrations_enabled: true,
            require_email_verification: false,
            default_chat_model: "gpt-4o-mini".to_string(),
            default_embedding_model: "text-embedding-3-small".to_string(),
            default_embedding_dimensions: 1536,
        }
    }

    /// Idempotent: called from `apply_migrations` every startup, only creates the row
    /// on its first run.
    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<Self, AppError> {
        if let Some(existing) = db.get_item::<Self>("current").await? {
            return Ok(existing);
        }

        let stored: Option<Self> = db.store_item(Self::defaults()).await?;
        stored.ok_or_else(|| AppError::internal("failed to initialize system settings"))
    }

    pub async fn get_current(db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item("current")
            .await?
            .ok_or_else(|| AppError::NotFound("system settings not found".into()))
    }

    pub async fn update(db: &SurrealDbClient, changes: Self) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .query("UPDATE type::thing('system_settings', 'current') MERGE $changes RETURN AFTER")
            .bind(("changes", changes))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::Validation("failed to update system settings".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let first = SystemSettings::get_current(&db).await.expect("get");
        assert_eq!(first.id, "current");
        assert!(first.registrations_enabled);

        db.apply_migrations().await.expect("migrations again");
        let second = SystemSettings::get_current(&db).await.expect("get again");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn update_merges_changes() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let mut settings = SystemSettings::get_current(&db).await.unwrap();
        settings.registrations_enabled = false;
        let updated = SystemSettings::update(&db, settings).await.expect("update");
        assert!(!updated.registrations_enabled);
    }

    #[tokio::test]
    async fn get_current_before_init_is_not_found() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        let result = SystemSettings::get_current(&db).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
