use common::utils::config::AppConfig;

/// Retry tuning for `embed_batch` (§4.2: "retry backoff max 3 attempts, jitter
/// 0.1-0.5s x 2^attempt").
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub embed_retry_attempts: usize,
    pub embed_retry_jitter_min_ms: u64,
    pub embed_retry_jitter_max_ms: u64,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            embed_retry_attempts: 3,
            embed_retry_jitter_min_ms: 100,
            embed_retry_jitter_max_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_line_len: usize,
    pub embedding_batch_size: usize,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning::default(),
            max_file_size: config.max_file_size,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_line_len: config.min_line_len,
            embedding_batch_size: config.embedding_batch_size,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}
