use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Blob storage backend selection (§6 `storage`).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// How hard to try before falling back to vision-LLM extraction for a PDF whose
/// text layer looks too sparse (§4.1: "OCR is a fallback only when primary
/// extraction yields <1% ink ratio").
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PdfIngestMode {
    /// Text-layer extraction only; fail the document if it looks scanned.
    Classic,
    /// Text-layer extraction first, vision-LLM screenshot fallback second.
    LlmFirst,
}

fn default_pdf_ingest_mode() -> PdfIngestMode {
    PdfIngestMode::LlmFirst
}

/// Which provider backs `embed_batch` (§4.2).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// `async-openai`-backed remote embedding calls.
    OpenAi,
    /// Local `fastembed` model, no network round trip.
    Fastembed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAi
}

/// Cache backend selection (§6 `cache_backend`). Only `in-memory` actually ships;
/// the variant exists so the option is configuration-selected without a second
/// cache dependency for a backend nothing in this corpus needs.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackend {
    InMemory,
    NetworkKv,
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::InMemory
}

/// Vector store backend selection (§6 `vector_store_kind`).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorStoreKind {
    /// SurrealDB's HNSW index, the only backend actually wired up.
    Surreal,
}

fn default_vector_store_kind() -> VectorStoreKind {
    VectorStoreKind::Surreal
}

/// Default rerank mode (§4.4).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    WeightedScore,
    CrossEncoder,
    Bm25,
}

fn default_rerank_mode() -> RerankMode {
    RerankMode::WeightedScore
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_pdf_ingest_mode")]
    pub pdf_ingest_mode: PdfIngestMode,

    // Ingestion (§4.1, §6)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_ingest_max_files")]
    pub ingest_max_files: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_line_len")]
    pub min_line_len: usize,

    // Embedding + index builder (§4.2)
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_cache_ttl_s")]
    pub embedding_cache_ttl_s: u64,
    #[serde(default = "default_fastembed_max_length")]
    pub fastembed_max_length: usize,
    #[serde(default = "default_vector_store_kind")]
    pub vector_store_kind: VectorStoreKind,

    // Training coordinator (§4.3)
    #[serde(default = "default_training_workers")]
    pub training_workers: usize,
    #[serde(default = "default_training_lease_secs")]
    pub training_lease_secs: u64,

    // Retrieval engine (§4.4)
    #[serde(default = "default_top_k")]
    pub top_k_default: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold_default: f32,
    #[serde(default = "default_use_rerank")]
    pub use_rerank_default: bool,
    #[serde(default = "default_rerank_mode")]
    pub rerank_mode_default: RerankMode,
    #[serde(default = "default_reranking_enabled")]
    pub reranking_enabled: bool,
    #[serde(default = "default_reranking_pool_size")]
    pub reranking_pool_size: usize,
    #[serde(default = "default_query_cache_ttl_s")]
    pub query_cache_ttl_s: u64,
    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: usize,
    #[serde(default = "default_cache_backend")]
    pub cache_backend: CacheBackend,

    // Chat session manager (§4.5)
    #[serde(default = "default_chat_idle_timeout_s")]
    pub chat_idle_timeout_s: u64,
    #[serde(default = "default_chat_replay_count")]
    pub chat_replay_count: u32,
    #[serde(default = "default_chat_outbound_queue")]
    pub chat_outbound_queue: usize,

    // Webhook dispatcher (§4.6)
    #[serde(default = "default_webhook_workers")]
    pub webhook_workers: usize,
    #[serde(default = "default_webhook_queue_capacity")]
    pub webhook_queue_capacity: usize,

    // API gate (§4.7)
    #[serde(default = "default_rate_limit_per_user")]
    pub api_rate_limit_per_user: u32,
    #[serde(default = "default_rate_limit_per_ip")]
    pub api_rate_limit_per_ip: u32,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_ingest_max_files() -> usize {
    20
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_line_len() -> usize {
    3
}
fn default_embedding_batch_size() -> usize {
    100
}
fn default_embedding_cache_ttl_s() -> u64 {
    7 * 24 * 3600
}
fn default_fastembed_max_length() -> usize {
    512
}
fn default_training_workers() -> usize {
    4
}
fn default_training_lease_secs() -> u64 {
    120
}
fn default_top_k() -> usize {
    10
}
fn default_score_threshold() -> f32 {
    0.5
}
fn default_use_rerank() -> bool {
    false
}
fn default_reranking_enabled() -> bool {
    true
}
fn default_reranking_pool_size() -> usize {
    2
}
fn default_query_cache_ttl_s() -> u64 {
    3600
}
fn default_query_cache_capacity() -> usize {
    256
}
fn default_chat_idle_timeout_s() -> u64 {
    3600
}
fn default_chat_replay_count() -> u32 {
    50
}
fn default_chat_outbound_queue() -> usize {
    256
}
fn default_webhook_workers() -> usize {
    8
}
fn default_webhook_queue_capacity() -> usize {
    1024
}
fn default_rate_limit_per_user() -> u32 {
    1000
}
fn default_rate_limit_per_ip() -> u32 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            openai_api_key: String::new(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: "default".to_string(),
            surrealdb_database: "default".to_string(),
            data_dir: default_data_dir(),
            http_port: 8080,
            openai_base_url: default_base_url(),
            storage: default_storage_kind(),
            pdf_ingest_mode: default_pdf_ingest_mode(),
            max_file_size: default_max_file_size(),
            ingest_max_files: default_ingest_max_files(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_line_len: default_min_line_len(),
            embedding_backend: default_embedding_backend(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_cache_ttl_s: default_embedding_cache_ttl_s(),
            fastembed_max_length: default_fastembed_max_length(),
            vector_store_kind: default_vector_store_kind(),
            training_workers: default_training_workers(),
            training_lease_secs: default_training_lease_secs(),
            top_k_default: default_top_k(),
            score_threshold_default: default_score_threshold(),
            use_rerank_default: default_use_rerank(),
            rerank_mode_default: default_rerank_mode(),
            reranking_enabled: default_reranking_enabled(),
            reranking_pool_size: default_reranking_pool_size(),
            query_cache_ttl_s: default_query_cache_ttl_s(),
            query_cache_capacity: default_query_cache_capacity(),
            cache_backend: default_cache_backend(),
            chat_idle_timeout_s: default_chat_idle_timeout_s(),
            chat_replay_count: default_chat_replay_count(),
            chat_outbound_queue: default_chat_outbound_queue(),
            webhook_workers: default_webhook_workers(),
            webhook_queue_capacity: default_webhook_queue_capacity(),
            api_rate_limit_per_user: default_rate_limit_per_user(),
            api_rate_limit_per_ip: default_rate_limit_per_ip(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_struct_update_syntax() {
        let cfg = AppConfig {
            chunk_size: 500,
            ..Default::default()
        };
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.chunk_overlap, 200);
        assert_eq!(cfg.storage, StorageKind::Local);
    }
}
