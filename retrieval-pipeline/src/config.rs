use common::utils::config::AppConfig;

pub use common::utils::config::RerankMode;

/// `method` from `query()`'s contract (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMethod {
    Semantic,
    Keyword,
    Hybrid,
}

impl Default for RetrievalMethod {
    fn default() -> Self {
        Self::Hybrid
    }
}

/// Tunable parameters that govern `query()`'s candidate generation, fusion and
/// rerank stages, seeded from `AppConfig` with the per-method score threshold
/// split spec.md §4.4 calls for (0.7 pure semantic, 0.5 otherwise) that the
/// config table only carries a single default for.
#[derive(Debug, Clone)]
pub struct RetrievalTuning {
    pub top_k_default: usize,
    pub semantic_score_threshold_default: f32,
    pub hybrid_score_threshold_default: f32,
    pub use_rerank_default: bool,
    pub rerank_mode_default: RerankMode,
    pub reranking_enabled: bool,
    pub reranking_pool_size: usize,
    pub query_cache_ttl_s: u64,
    pub query_cache_capacity: usize,
    pub semantic_weight_default: f32,
    pub keyword_weight_default: f32,
    pub rrf_k: f32,
    pub cross_encoder_batch_size: usize,
    pub recency_halflife_days: f32,
}

impl RetrievalTuning {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            top_k_default: config.top_k_default,
            semantic_score_threshold_default: 0.7,
            hybrid_score_threshold_default: config.score_threshold_default,
            use_rerank_default: config.use_rerank_default,
            rerank_mode_default: config.rerank_mode_default,
            reranking_enabled: config.reranking_enabled,
            reranking_pool_size: config.reranking_pool_size,
            query_cache_ttl_s: config.query_cache_ttl_s,
            query_cache_capacity: config.query_cache_capacity,
            semantic_weight_default: 0.7,
            keyword_weight_default: 0.3,
            rrf_k: 60.0,
            cross_encoder_batch_size: 32,
            recency_halflife_days: 30.0,
        }
    }
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}
