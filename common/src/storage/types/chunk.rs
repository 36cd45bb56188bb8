use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

stored_object!(Chunk, "chunk", {
    document_id: String,
    kb_id: String,
    ordinal: u32,
    text: String,
    byte_len: u32,
    #[serde(default)]
    metadata: HashMap<String, Value>,
});

impl Chunk {
    pub fn new(
        document_id: String,
        kb_id: String,
        ordinal: u32,
        text: String,
        metadata: HashMap<String, Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            byte_len: text.len() as u32,
            document_id,
            kb_id,
            ordinal,
            text,
            metadata,
        }
    }

    pub async fn store_all(db: &SurrealDbClient, chunks: Vec<Self>) -> Result<(), AppError> {
        for chunk in chunks {
            db.store_item(chunk).await?;
        }
        Ok(())
    }

    pub async fn list_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query("SELECT * FROM chunk WHERE document_id = $doc ORDER BY ordinal ASC")
            .bind(("doc", document_id.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn delete_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE chunk WHERE document_id = $doc")
            .bind(("doc", document_id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn get_many(db: &SurrealDbClient, ids: &[String]) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<surrealdb::sql::Thing> = ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from((Self::table_name(), id.as_str())))
            .collect();
        let mut res = db
            .client
            .query("SELECT * FROM chunk WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(res.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ordinal_preserves_document_order() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let chunks = vec![
            Chunk::new("doc-1".into(), "kb-1".into(), 0, "first".into(), HashMap::new()),
            Chunk::new("doc-1".into(), "kb-1".into(), 1, "second".into(), HashMap::new()),
        ];
        Chunk::store_all(&db, chunks).await.expect("store");

        let fetched = Chunk::list_for_document(&db, "doc-1").await.expect("list");
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].ordinal, 0);
        assert_eq!(fetched[1].ordinal, 1);
    }
}
