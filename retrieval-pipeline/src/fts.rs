use serde::Deserialize;
use tracing::debug;

use common::{error::AppError, storage::db::SurrealDbClient};

/// One lexical hit: a chunk id plus the BM25 relevance score SurrealDB's
/// `search::score` returns for the index position it was matched against.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Deserialize)]
struct ScoreRow {
    #[serde(deserialize_with = "common::storage::types::deserialize_flexible_id")]
    id: String,
    score: Option<f32>,
}

/// Keyword branch of `query()` (spec.md §4.4 step 2): BM25 over `chunk.text` via
/// `chunk_text_fts_idx` (`common::storage::indexes`, `BM25(1.2,0.75)`, analyzer
/// `app_en_fts_analyzer` — lowercase, Unicode word split). `document_ids` narrows
/// the scan to a caller-supplied filter set when present.
pub async fn keyword_search(
    db: &SurrealDbClient,
    kb_id: &str,
    query_text: &str,
    fetch_k: usize,
    document_ids: Option<&[String]>,
) -> Result<Vec<KeywordHit>, AppError> {
    let mut sql = String::from(
        "SELECT id, search::score(0) AS score FROM chunk \
         WHERE kb_id = $kb AND text @0@ $terms",
    );
    if document_ids.is_some() {
        sql.push_str(" AND document_id IN $docs");
    }
    sql.push_str(" ORDER BY score DESC LIMIT $limit;");

    debug!(kb_id, fetch_k, "executing keyword search");

    let mut request = db
        .client
        .query(sql)
        .bind(("kb", kb_id.to_string()))
        .bind(("terms", query_text.to_string()))
        .bind(("limit", fetch_k as i64));
    if let Some(docs) = document_ids {
        request = request.bind(("docs", docs.to_vec()));
    }

    let mut response = request.await?;
    let rows: Vec<ScoreRow> = response.take(0)?;

    Ok(rows
        .into_iter()
        .map(|row| KeywordHit {
            chunk_id: row.id,
            score: row.score.unwrap_or(0.0),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::{indexes::ensure_runtime_indexes, types::chunk::Chunk};
    use uuid::Uuid;

    #[tokio::test]
    async fn keyword_search_finds_matching_chunk_text() {
        let db = SurrealDbClient::memory("fts_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        ensure_runtime_indexes(&db, 8).await.expect("indexes");

        Chunk::store_all(
            &db,
            vec![
                Chunk::new(
                    "doc-1".into(),
                    "kb-1".into(),
                    0,
                    "GraphQL documentation reference".into(),
                    Default::default(),
                ),
                Chunk::new(
                    "doc-1".into(),
                    "kb-1".into(),
                    1,
                    "completely unrelated content about gardening".into(),
                    Default::default(),
                ),
            ],
        )
        .await
        .expect("store chunks");

        db.rebuild_indexes().await.expect("rebuild indexes");

        let hits = keyword_search(&db, "kb-1", "graphql", 5, None)
            .await
            .expect("keyword search");

        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_search_respects_document_filter() {
        let db = SurrealDbClient::memory("fts_test_ns2", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        ensure_runtime_indexes(&db, 8).await.expect("indexes");

        Chunk::store_all(
            &db,
            vec![
                Chunk::new("doc-a".into(), "kb-1".into(), 0, "rust async runtime".into(), Default::default()),
                Chunk::new("doc-b".into(), "kb-1".into(), 0, "rust async runtime".into(), Default::default()),
            ],
        )
        .await
        .expect("store chunks");

        db.rebuild_indexes().await.expect("rebuild indexes");

        let hits = keyword_search(
            &db,
            "kb-1",
            "rust",
            5,
            Some(&["doc-a".to_string()]),
        )
        .await
        .expect("keyword search");

        assert_eq!(hits.len(), 1);
    }
}
