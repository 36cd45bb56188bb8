use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

stored_object!(Embedding, "embedding", {
    chunk_id: String,
    kb_id: String,
    model: String,
    vector: Vec<f32>,
    checksum: String,
});

impl Embedding {
    pub fn new(chunk_id: String, kb_id: String, model: String, vector: Vec<f32>) -> Self {
        let now = chrono::Utc::now();
        let checksum = checksum_of(&vector);
        Embedding {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id,
            kb_id,
            model,
            vector,
            checksum,
        }
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .upsert::<Option<Self>>((Embedding::table_name(), self.id.clone()))
            .content(self.clone())
            .await?;
        Ok(())
    }

    /// Idempotent upsert keyed by `(chunk_id, model)`: reprocessing a chunk with the
    /// same model overwrites the existing row in place instead of inserting a second
    /// one that would trip the `idx_embedding_chunk` unique index.
    pub async fn upsert_for_chunk(
        db: &SurrealDbClient,
        chunk_id: String,
        kb_id: String,
        model: String,
        vector: Vec<f32>,
    ) -> Result<Self, AppError> {
        let record = match Self::get_for_chunk(db, &chunk_id, &model).await? {
            Some(mut existing) => {
                existing.vector = vector;
                existing.checksum = checksum_of(&existing.vector);
                existing.updated_at = chrono::Utc::now();
                existing
            }
            None => Self::new(chunk_id, kb_id, model, vector),
        };
        record.upsert(db).await?;
        Ok(record)
    }

    pub async fn get_for_chunk(
        db: &SurrealDbClient,
        chunk_id: &str,
        model: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut res = db
            .client
            .query("SELECT * FROM embedding WHERE chunk_id = $chunk AND model = $model LIMIT 1")
            .bind(("chunk", chunk_id.to_string()))
            .bind(("model", model.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn delete_for_document(
        db: &SurrealDbClient,
        document_chunk_ids: &[String],
    ) -> Result<(), AppError> {
        if document_chunk_ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE embedding WHERE chunk_id IN $ids")
            .bind(("ids", document_chunk_ids.to_vec()))
            .await?;
        Ok(())
    }
}

fn checksum_of(vector: &[f32]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let embedding = Embedding::new("chunk-1".into(), "kb-1".into(), "model-a".into(), vec![0.1, 0.2]);
        embedding.upsert(&db).await.expect("first upsert");
        embedding.upsert(&db).await.expect("second upsert");

        let fetched = Embedding::get_for_chunk(&db, "chunk-1", "model-a")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.vector, vec![0.1, 0.2]);
    }
}
