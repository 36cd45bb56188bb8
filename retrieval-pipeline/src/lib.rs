//! Answers queries against a trained knowledge base (§4.4): cache lookup,
//! semantic/keyword/hybrid candidate generation, fusion, optional rerank,
//! threshold+trim, document/chunk metadata population and usage recording.

pub mod config;
pub mod fts;
pub mod fusion;
pub mod reranking;
pub mod scoring;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        cache::TtlCache,
        db::SurrealDbClient,
        types::{
            chunk::Chunk,
            document::Document,
            knowledge_base::{KnowledgeBase, TrainingStatus},
            usage_counters::UsageCounters,
            StoredObject,
        },
        vector_store::{VectorMatch, VectorStore},
    },
    utils::{
        config::AppConfig,
        embedding::{embedding_cache_key, EmbeddingProvider},
    },
};
use tracing::warn;

pub use config::{RerankMode, RetrievalMethod, RetrievalTuning};
pub use fts::{keyword_search, KeywordHit};
pub use fusion::{reciprocal_rank_fusion, weighted_sum_fusion};
pub use reranking::RerankerPool;
pub use scoring::{min_max_normalize, sort_by_fused_desc, Scored, Scores};

/// Embedding-cache capacity for query-time embeddings. `AppConfig` only carries
/// a TTL for this cache (§6 `embedding_cache_ttl_s`), not a size bound, so this
/// stays a fixed constant rather than growing unbounded with distinct queries.
const QUERY_EMBEDDING_CACHE_CAPACITY: usize = 1000;

/// Weight given to the recency sub-score in `weighted_score` reranking (§4.4
/// step 3), on top of the semantic/keyword split `RetrievalTuning` already
/// carries.
const RECENCY_WEIGHT: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub id: String,
    pub title: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub ordinal: u32,
    pub text: String,
    pub score: f32,
    pub document: RetrievedDocument,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    pub cache_hit: bool,
    /// Set when the KB is `stopped` with a non-empty partial index rather
    /// than fully `ready` (§4.4: "a warning flag is set on the response").
    pub degraded: bool,
}

/// `query(kb, text, method, top_k, score_threshold, use_rerank, rerank_mode,
/// filters)`'s request (§4.4). `None` fields fall back to `RetrievalTuning`'s
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub kb_id: String,
    pub text: String,
    pub method: RetrievalMethod,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    pub use_rerank: Option<bool>,
    pub rerank_mode: Option<RerankMode>,
    pub filters: Option<Vec<String>>,
    pub semantic_weight: Option<f32>,
    pub keyword_weight: Option<f32>,
}

pub struct RetrievalEngine {
    db: Arc<SurrealDbClient>,
    embedding_provider: Arc<EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    reranker: Option<Arc<RerankerPool>>,
    tuning: RetrievalTuning,
    query_cache: TtlCache<String, RetrievalResult>,
    embedding_cache: TtlCache<String, Vec<f32>>,
}

impl RetrievalEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedding_provider: Arc<EmbeddingProvider>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Option<Arc<RerankerPool>>,
        app_config: &AppConfig,
    ) -> Self {
        let tuning = RetrievalTuning::from_app_config(app_config);
        Self {
            db,
            embedding_provider,
            vector_store,
            reranker,
            query_cache: TtlCache::new(
                tuning.query_cache_capacity,
                Duration::from_secs(tuning.query_cache_ttl_s),
            ),
            embedding_cache: TtlCache::new(
                QUERY_EMBEDDING_CACHE_CAPACITY,
                Duration::from_secs(app_config.embedding_cache_ttl_s),
            ),
            tuning,
        }
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<RetrievalResult, AppError> {
        let started = std::time::Instant::now();
        let kb = KnowledgeBase::get(&self.db, &request.kb_id).await?;
        let degraded = match kb.training_status {
            TrainingStatus::Ready => false,
            TrainingStatus::Stopped if kb.processed_docs > 0 => true,
            _ => return Err(AppError::KnowledgeBaseNotReady),
        };

        let model = self.embedding_provider.model_name().to_string();
        let top_k = request.top_k.unwrap_or(self.tuning.top_k_default).clamp(1, 100);
        let threshold = request
            .score_threshold
            .unwrap_or(match request.method {
                RetrievalMethod::Semantic => self.tuning.semantic_score_threshold_default,
                RetrievalMethod::Keyword | RetrievalMethod::Hybrid => {
                    self.tuning.hybrid_score_threshold_default
                }
            })
            .clamp(0.0, 1.0);
        let use_rerank = request.use_rerank.unwrap_or(self.tuning.use_rerank_default);
        let rerank_mode = request.rerank_mode.unwrap_or(self.tuning.rerank_mode_default);

        let cache_key = format!(
            "{}|{model}|{:?}|{top_k}|{threshold}|{use_rerank}|{rerank_mode:?}|{:?}|{}",
            request.kb_id, request.method, request.filters, request.text
        );

        if let Some(mut cached) = self.query_cache.get(&cache_key) {
            cached.cache_hit = true;
            UsageCounters::record_query(
                &self.db,
                &request.kb_id,
                started.elapsed().as_millis() as u64,
                true,
            )
            .await?;
            return Ok(cached);
        }

        let fetch_k = (top_k * 4).max(50);
        let mut scored = self
            .candidates(&request.kb_id, &model, request, fetch_k)
            .await?;

        if use_rerank {
            self.rerank(&request.kb_id, &request.text, rerank_mode, &mut scored)
                .await?;
        }

        sort_by_fused_desc(&mut scored);
        scored.retain(|item| item.fused >= threshold);
        scored.truncate(top_k);

        let chunks = self.populate(scored).await?;
        let result = RetrievalResult {
            chunks,
            cache_hit: false,
            degraded,
        };

        self.query_cache.put(cache_key, result.clone());
        UsageCounters::record_query(
            &self.db,
            &request.kb_id,
            started.elapsed().as_millis() as u64,
            false,
        )
        .await?;

        Ok(result)
    }

    async fn embed_cached(&self, model: &str, text: &str) -> Result<Vec<f32>, AppError> {
        let key = embedding_cache_key(model, text);
        if let Some(vector) = self.embedding_cache.get(&key) {
            return Ok(vector);
        }
        let vector = self.embedding_provider.embed(text).await?;
        self.embedding_cache.put(key, vector.clone());
        Ok(vector)
    }

    async fn semantic_hits(
        &self,
        kb_id: &str,
        model: &str,
        text: &str,
        fetch_k: usize,
    ) -> Result<Vec<VectorMatch>, AppError> {
        let vector = self.embed_cached(model, text).await?;
        self.vector_store
            .similarity_search(kb_id, model, &vector, fetch_k)
            .await
    }

    async fn candidates(
        &self,
        kb_id: &str,
        model: &str,
        request: &QueryRequest,
        fetch_k: usize,
    ) -> Result<Vec<Scored<Chunk>>, AppError> {
        let mut scores_by_id: HashMap<String, Scores> = HashMap::new();
        let mut fused_by_id: HashMap<String, f32> = HashMap::new();

        match request.method {
            RetrievalMethod::Semantic => {
                let hits = self.semantic_hits(kb_id, model, &request.text, fetch_k).await?;
                for hit in hits {
                    scores_by_id.entry(hit.chunk_id.clone()).or_default().vector = Some(hit.score);
                    fused_by_id.insert(hit.chunk_id, hit.score);
                }
            }
            RetrievalMethod::Keyword => {
                let hits = keyword_search(
                    &self.db,
                    kb_id,
                    &request.text,
                    fetch_k,
                    request.filters.as_deref(),
                )
                .await?;
                let raw: Vec<f32> = hits.iter().map(|hit| hit.score).collect();
                let normalized = min_max_normalize(&raw);
                for (hit, norm) in hits.into_iter().zip(normalized) {
                    scores_by_id.entry(hit.chunk_id.clone()).or_default().fts = Some(hit.score);
                    fused_by_id.insert(hit.chunk_id, norm);
                }
            }
            RetrievalMethod::Hybrid => {
                let (vector_hits, keyword_hits) = tokio::join!(
                    self.semantic_hits(kb_id, model, &request.text, fetch_k),
                    keyword_search(&self.db, kb_id, &request.text, fetch_k, request.filters.as_deref()),
                );
                let vector_hits = vector_hits?;
                let keyword_hits = keyword_hits?;

                for hit in &vector_hits {
                    scores_by_id.entry(hit.chunk_id.clone()).or_default().vector = Some(hit.score);
                }
                for hit in &keyword_hits {
                    scores_by_id.entry(hit.chunk_id.clone()).or_default().fts = Some(hit.score);
                }

                let vector_pairs: Vec<(String, f32)> =
                    vector_hits.into_iter().map(|hit| (hit.chunk_id, hit.score)).collect();
                let keyword_pairs: Vec<(String, f32)> =
                    keyword_hits.into_iter().map(|hit| (hit.chunk_id, hit.score)).collect();

                fused_by_id = match (request.semantic_weight, request.keyword_weight) {
                    (Some(sw), Some(kw)) => {
                        weighted_sum_fusion(&vector_pairs, &keyword_pairs, sw, kw)
                    }
                    _ => reciprocal_rank_fusion(&[&vector_pairs, &keyword_pairs], self.tuning.rrf_k),
                };
            }
        }

        if scores_by_id.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = scores_by_id.keys().cloned().collect();
        let chunks = Chunk::get_many(&self.db, &ids).await?;
        let chunk_by_id: HashMap<String, Chunk> =
            chunks.into_iter().map(|chunk| (chunk.id.clone(), chunk)).collect();

        let mut scored = Vec::with_capacity(scores_by_id.len());
        for (id, scores) in scores_by_id {
            let Some(chunk) = chunk_by_id.get(&id) else {
                continue;
            };
            let fused = fused_by_id.get(&id).copied().unwrap_or(0.0);
            let mut item = Scored::new(chunk.clone());
            item.scores = scores;
            item.update_fused(fused);
            scored.push(item);
        }
        sort_by_fused_desc(&mut scored);
        Ok(scored)
    }

    /// Rerank step (§4.4 step 3). Mutates `fused` in place; callers re-sort
    /// and re-threshold afterwards.
    async fn rerank(
        &self,
        kb_id: &str,
        query_text: &str,
        mode: RerankMode,
        scored: &mut [Scored<Chunk>],
    ) -> Result<(), AppError> {
        if scored.is_empty() {
            return Ok(());
        }
        match mode {
            RerankMode::WeightedScore => {
                let now = Utc::now();
                let halflife = self.tuning.recency_halflife_days.max(1.0);
                for item in scored.iter_mut() {
                    let age_days = (now - item.item.created_at).num_seconds() as f32 / 86400.0;
                    let recency = (-age_days.max(0.0) / halflife).exp();
                    let semantic = item.scores.vector.unwrap_or(0.0);
                    let keyword = item.scores.fts.unwrap_or(0.0);
                    let weighted = semantic * self.tuning.semantic_weight_default
                        + keyword * self.tuning.keyword_weight_default
                        + recency * RECENCY_WEIGHT;
                    item.update_fused(weighted.clamp(0.0, 1.0));
                }
            }
            RerankMode::Bm25 => {
                let hits = keyword_search(&self.db, kb_id, query_text, scored.len().max(50), None)
                    .await?;
                let raw: Vec<f32> = hits.iter().map(|hit| hit.score).collect();
                let normalized = min_max_normalize(&raw);
                let score_by_id: HashMap<String, f32> = hits
                    .into_iter()
                    .map(|hit| hit.chunk_id)
                    .zip(normalized)
                    .collect();
                for item in scored.iter_mut() {
                    let score = score_by_id.get(&item.item.id).copied().unwrap_or(0.0);
                    item.update_fused(score);
                }
            }
            RerankMode::CrossEncoder => {
                let Some(pool) = self.reranker.clone() else {
                    warn!("cross_encoder rerank requested but no reranker pool is configured, skipping");
                    return Ok(());
                };
                let lease = pool.checkout().await;
                let documents: Vec<String> = scored.iter().map(|item| item.item.text.clone()).collect();
                let results = lease
                    .rerank(query_text, documents, self.tuning.cross_encoder_batch_size)
                    .await?;
                let raw: Vec<f32> = results.iter().map(|result| result.score).collect();
                let normalized = min_max_normalize(&raw);
                for (result, norm) in results.into_iter().zip(normalized) {
                    if let Some(item) = scored.get_mut(result.index) {
                        item.update_fused(norm);
                    }
                }
            }
        }
        Ok(())
    }

    /// Populate step (§4.4 step 5): attaches document summary + chunk index,
    /// dropping any chunk whose document was deleted from the relational
    /// store even if the vector store hasn't been compacted yet.
    async fn populate(&self, scored: Vec<Scored<Chunk>>) -> Result<Vec<RetrievedChunk>, AppError> {
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let document_ids: Vec<String> = {
            let mut ids: Vec<String> = scored.iter().map(|item| item.item.document_id.clone()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let documents = Document::get_many(&self.db, &document_ids).await?;
        let document_by_id: HashMap<String, Document> =
            documents.into_iter().map(|doc| (doc.id.clone(), doc)).collect();

        Ok(scored
            .into_iter()
            .filter_map(|item| {
                let document = document_by_id.get(&item.item.document_id)?;
                Some(RetrievedChunk {
                    chunk_id: item.item.id.clone(),
                    ordinal: item.item.ordinal,
                    text: item.item.text.clone(),
                    score: item.fused,
                    document: RetrievedDocument {
                        id: document.id.clone(),
                        title: document.title.clone(),
                        source_url: document.source_url.clone(),
                    },
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::{
        indexes::ensure_runtime_indexes,
        types::{document::DocumentKind, knowledge_base::LlmConfig},
        vector_store::SurrealVectorStore,
    };
    use uuid::Uuid;

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("retrieval_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        ensure_runtime_indexes(&db, 8).await.expect("indexes");
        Arc::new(db)
    }

    async fn ready_kb_with_chunk(db: &SurrealDbClient, text: &str) -> (KnowledgeBase, Document) {
        let kb = KnowledgeBase::create_with_owner(
            db,
            "owner-1".into(),
            "kb".into(),
            "general".into(),
            LlmConfig::default(),
        )
        .await
        .expect("create kb");
        KnowledgeBase::request_training(db, &kb.id).await.expect("queue");
        KnowledgeBase::transition_to_training(db, &kb.id, 1).await.expect("start");

        let document = Document::new(
            kb.id.clone(),
            "doc".into(),
            None,
            Document::hash_bytes(text.as_bytes()),
            text.len() as u64,
            DocumentKind::Txt,
        );
        db.store_item(document.clone()).await.expect("store document");

        let chunk = Chunk::new(document.id.clone(), kb.id.clone(), 0, text.to_string(), Default::default());
        Chunk::store_all(db, vec![chunk]).await.expect("store chunk");

        KnowledgeBase::record_progress(db, &kb.id, 1).await.expect("progress");
        let kb = KnowledgeBase::mark_ready(db, &kb.id).await.expect("ready");
        db.rebuild_indexes().await.expect("rebuild indexes");
        (kb, document)
    }

    fn engine(db: Arc<SurrealDbClient>) -> RetrievalEngine {
        let embedding_provider = Arc::new(EmbeddingProvider::new_hashed(16).expect("provider"));
        let vector_store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new((*db).clone()));
        RetrievalEngine::new(db, embedding_provider, vector_store, None, &AppConfig::default())
    }

    #[tokio::test]
    async fn query_fails_when_kb_not_ready() {
        let db = test_db().await;
        let kb = KnowledgeBase::create_with_owner(
            &db,
            "owner-1".into(),
            "kb".into(),
            "general".into(),
            LlmConfig::default(),
        )
        .await
        .expect("create kb");
        let engine = engine(Arc::clone(&db));

        let err = engine
            .query(&QueryRequest {
                kb_id: kb.id,
                text: "hello".into(),
                method: RetrievalMethod::Semantic,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::KnowledgeBaseNotReady));
    }

    #[tokio::test]
    async fn keyword_query_finds_and_populates_matching_chunk() {
        let db = test_db().await;
        let (kb, document) = ready_kb_with_chunk(&db, "graphql documentation reference").await;
        let engine = engine(Arc::clone(&db));

        let result = engine
            .query(&QueryRequest {
                kb_id: kb.id,
                text: "graphql".into(),
                method: RetrievalMethod::Keyword,
                score_threshold: Some(0.0),
                ..Default::default()
            })
            .await
            .expect("query");

        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].document.id, document.id);
        assert!(!result.cache_hit);
    }

    #[tokio::test]
    async fn repeated_query_hits_the_cache() {
        let db = test_db().await;
        let (kb, _document) = ready_kb_with_chunk(&db, "graphql documentation reference").await;
        let engine = engine(Arc::clone(&db));

        let request = QueryRequest {
            kb_id: kb.id,
            text: "graphql".into(),
            method: RetrievalMethod::Keyword,
            score_threshold: Some(0.0),
            ..Default::default()
        };

        let first = engine.query(&request).await.expect("first query");
        assert!(!first.cache_hit);
        let second = engine.query(&request).await.expect("second query");
        assert!(second.cache_hit);
        assert_eq!(first.chunks.len(), second.chunks.len());
    }

    #[tokio::test]
    async fn deleted_document_is_filtered_out_even_if_vector_store_still_has_it() {
        let db = test_db().await;
        let (kb, document) = ready_kb_with_chunk(&db, "graphql documentation reference").await;
        let engine = engine(Arc::clone(&db));

        db.client
            .delete::<Option<Document>>((Document::table_name(), document.id.clone()))
            .await
            .expect("delete document");

        let result = engine
            .query(&QueryRequest {
                kb_id: kb.id,
                text: "graphql".into(),
                method: RetrievalMethod::Keyword,
                score_threshold: Some(0.0),
                ..Default::default()
            })
            .await
            .expect("query");

        assert!(result.chunks.is_empty());
    }
}
