use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        indexes,
        types::{chunk::Chunk, embedding::Embedding, StoredObject},
    },
};

/// A single similarity hit: the matched chunk id plus a cosine-rescaled score in
/// `[0, 1]` (§4.2 "similarity scores in [0,1] cosine-rescaled").
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub chunk_id: String,
    pub score: f32,
}

/// Capability set a vector store backend must provide for the retrieval engine
/// and index builder (§4.2): upsert, delete-by-kb, delete-by-document,
/// similarity search, health check and index optimization. `vector_store_kind`
/// (§6) selects an implementation; only [`SurrealVectorStore`] ships here since
/// no other backend appears anywhere in this corpus.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        kb_id: &str,
        model: &str,
        chunk_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), AppError>;

    async fn delete_by_kb(&self, kb_id: &str) -> Result<(), AppError>;

    async fn delete_by_document(&self, document_id: &str) -> Result<(), AppError>;

    async fn similarity_search(
        &self,
        kb_id: &str,
        model: &str,
        query_vector: &[f32],
        fetch_k: usize,
    ) -> Result<Vec<VectorMatch>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;

    async fn optimize(&self) -> Result<(), AppError>;
}

/// SurrealDB HNSW-backed implementation, grounded on the teacher's
/// `TextChunk::vector_search`/`KnowledgeEntity` cosine-similarity queries: the KNN
/// operator `<|take,ef|>` narrows the candidate set before `vector::similarity::cosine`
/// computes an exact score over it.
pub struct SurrealVectorStore {
    db: SurrealDbClient,
}

impl SurrealVectorStore {
    pub fn new(db: SurrealDbClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn upsert(
        &self,
        kb_id: &str,
        model: &str,
        chunk_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), AppError> {
        Embedding::upsert_for_chunk(
            &self.db,
            chunk_id.to_string(),
            kb_id.to_string(),
            model.to_string(),
            vector,
        )
        .await?;
        Ok(())
    }

    async fn delete_by_kb(&self, kb_id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query("DELETE embedding WHERE kb_id = $kb")
            .bind(("kb", kb_id.to_string()))
            .await?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<(), AppError> {
        let chunks = Chunk::list_for_document(&self.db, document_id).await?;
        let chunk_ids: Vec<String> = chunks
            .into_iter()
            .map(|chunk| chunk.get_id().to_string())
            .collect();
        Embedding::delete_for_document(&self.db, &chunk_ids).await
    }

    async fn similarity_search(
        &self,
        kb_id: &str,
        model: &str,
        query_vector: &[f32],
        fetch_k: usize,
    ) -> Result<Vec<VectorMatch>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: String,
            score: f32,
        }

        let ef = (fetch_k * 4).max(40);
        let sql = format!(
            "SELECT chunk_id, vector::similarity::cosine(vector, $query) AS score \
             FROM embedding \
             WHERE kb_id = $kb AND model = $model \
               AND vector <|{fetch_k},{ef}|> $query \
             ORDER BY score DESC \
             LIMIT {fetch_k};"
        );

        let mut response = self
            .db
            .client
            .query(&sql)
            .bind(("kb", kb_id.to_string()))
            .bind(("model", model.to_string()))
            .bind(("query", query_vector.to_vec()))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows
            .into_iter()
            .map(|row| VectorMatch {
                chunk_id: row.chunk_id,
                score: row.score.clamp(0.0, 1.0),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.db.client.query("SELECT 1;").await?;
        Ok(())
    }

    async fn optimize(&self) -> Result<(), AppError> {
        indexes::rebuild_indexes(&self.db).await
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
    async fn upsert_then_search_finds_the_closest_vector() {
        let db = test_db().await;
        let store = SurrealVectorStore::new(db.clone());

        Chunk::store_all(
            &db,
            vec![Chunk::new(
                "doc-1".into(),
                "kb-1".into(),
                0,
                "hello".into(),
                Default::default(),
            )],
        )
        .await
        .expect("store chunk");

        store
            .upsert("kb-1", "model-a", "chunk-1", vec![1.0, 0.0, 0.0])
            .await
            .expect("upsert");
        store
            .upsert("kb-1", "model-a", "chunk-2", vec![0.0, 1.0, 0.0])
            .await
            .expect("upsert");

        let matches = store
            .similarity_search("kb-1", "model-a", &[1.0, 0.0, 0.0], 1)
            .await
            .expect("search");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk_id, "chunk-1");
    }

    #[tokio::test]
    async fn delete_by_kb_clears_its_embeddings() {
        let db = test_db().await;
        let store = SurrealVectorStore::new(db.clone());
        store
            .upsert("kb-1", "model-a", "chunk-1", vec![1.0, 0.0])
            .await
            .expect("upsert");

        store.delete_by_kb("kb-1").await.expect("delete");

        let matches = store
            .similarity_search("kb-1", "model-a", &[1.0, 0.0], 5)
            .await
            .expect("search");
        assert!(matches.is_empty());
    }
}
