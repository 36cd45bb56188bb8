use std::sync::Arc;

use async_openai::types::CreateEmbeddingRequestArgs;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::system_settings::SystemSettings},
    utils::config::{AppConfig, EmbeddingBackend},
};

const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";
const OPENAI_DEFAULT_DIMENSIONS: u32 = 1536;
const FASTEMBED_DIMENSIONS: u32 = 384;
const HASHED_MODEL_NAME: &str = "hashed-fallback-v1";

/// Generates an embedding vector for `input` using the KB's configured default
/// model, looked up from `system_settings` on every call. Callers that already
/// know the model/dimensions (re-embedding, a KB pinned to a non-default model)
/// should use [`generate_embedding_with_params`] instead to avoid the extra read.
pub async fn generate_embedding(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    input: &str,
    db: &SurrealDbClient,
) -> Result<Vec<f32>, AppError> {
    let settings = SystemSettings::get_current(db).await?;

    generate_embedding_with_params(
        client,
        input,
        &settings.default_embedding_model,
        settings.default_embedding_dimensions,
    )
    .await
}

/// Generates an embedding vector using a specific model and dimension, skipping
/// the `system_settings` lookup (the batched re-embedding path in
/// `ingestion-pipeline` already knows both ahead of time).
pub async fn generate_embedding_with_params(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    input: &str,
    model: &str,
    dimensions: u32,
) -> Result<Vec<f32>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .input([input])
        .dimensions(dimensions)
        .build()?;

    let response = client.embeddings().create(request).await?;

    let embedding = response
        .data
        .first()
        .ok_or_else(|| AppError::ProviderError("no embedding data received from API".into()))?
        .embedding
        .clone();

    debug!("embedding created with {} dimensions", embedding.len());

    Ok(embedding)
}

/// Backend-agnostic embedding abstraction (§4.2). Grounded on the "hashed fallback +
/// local model + remote provider" shape so `embedding_backend` (§6) selects a
/// collaborator rather than branching call sites; a `Hashed` variant additionally
/// exists outside the config enum entirely, for tests that need a deterministic,
/// network-free vector of a caller-chosen dimension.
enum EmbeddingInner {
    OpenAi {
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
    },
    Fastembed {
        model: Arc<Mutex<TextEmbedding>>,
    },
    Hashed,
}

pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    dimension: u32,
}

impl EmbeddingProvider {
    /// Builds the provider selected by `config.embedding_backend`. The `OpenAi`
    /// backend requires a client (constructed once at process startup); panicking
    /// on a missing client here would be a programmer error, so it is surfaced as a
    /// `Configuration` error instead.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<async_openai::Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        match config.embedding_backend {
            EmbeddingBackend::OpenAi => {
                let client = openai_client.ok_or_else(|| {
                    AppError::internal("openai embedding backend selected without a client")
                })?;
                Ok(EmbeddingProvider {
                    inner: EmbeddingInner::OpenAi {
                        client,
                        model: OPENAI_DEFAULT_MODEL.to_string(),
                    },
                    dimension: OPENAI_DEFAULT_DIMENSIONS,
                })
            }
            EmbeddingBackend::Fastembed => {
                let cache_dir = std::path::Path::new(&config.data_dir)
                    .join("fastembed")
                    .join("embedding");
                std::fs::create_dir_all(&cache_dir)?;
                let model = TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_cache_dir(cache_dir)
                        .with_show_download_progress(false),
                )
                .map_err(|e| AppError::ProviderError(e.to_string()))?;
                Ok(EmbeddingProvider {
                    inner: EmbeddingInner::Fastembed {
                        model: Arc::new(Mutex::new(model)),
                    },
                    dimension: FASTEMBED_DIMENSIONS,
                })
            }
        }
    }

    /// Deterministic, network-free provider for tests: hashes tokens into a
    /// fixed-size vector via feature hashing. Never selected by `embedding_backend`.
    pub fn new_hashed(dimension: u32) -> Result<Self, AppError> {
        if dimension == 0 {
            return Err(AppError::Validation("embedding dimension must be > 0".into()));
        }
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::Hashed,
            dimension,
        })
    }

    pub fn dimension(&self) -> u32 {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        match &self.inner {
            EmbeddingInner::OpenAi { model, .. } => model,
            EmbeddingInner::Fastembed { .. } => "fastembed/all-MiniLM-L6-v2",
            EmbeddingInner::Hashed => HASHED_MODEL_NAME,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(self.embed_batch(std::slice::from_ref(&text.to_string())).await?.into_iter().next().unwrap_or_default())
    }

    /// Embeds a batch of already-chunked texts. Callers are responsible for
    /// splitting into `embedding_batch_size`-sized groups (§4.2); this just drives
    /// the single provider round trip for whatever slice it is given.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match &self.inner {
            EmbeddingInner::OpenAi { client, model } => {
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    out.push(
                        generate_embedding_with_params(client, text, model, self.dimension).await?,
                    );
                }
                Ok(out)
            }
            EmbeddingInner::Fastembed { model } => {
                let mut guard = model.lock().await;
                let owned: Vec<String> = texts.to_vec();
                guard
                    .embed(owned, None)
                    .map_err(|e| AppError::ProviderError(e.to_string()))
            }
            EmbeddingInner::Hashed => Ok(texts.iter().map(|t| hashed_vector(t, self.dimension)).collect()),
        }
    }
}

fn hashed_vector(text: &str, dimension: u32) -> Vec<f32> {
    let mut vector = vec![0f32; dimension as usize];
    for token in text.split_whitespace() {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % vector.len().max(1);
        let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
        if let Some(slot) = vector.get_mut(bucket) {
            *slot += sign;
        }
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// hash(model_spec ∥ normalized_text) used as both the embedding cache key and a
/// stable chunk-level checksum input (§4.2).
pub fn embedding_cache_key(model: &str, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized_text.as_bytes());
    hex::encode(hasher.finalize())
}
