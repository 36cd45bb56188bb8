//! Process entrypoint: wires every core component (§2's dependency order)
//! around one SurrealDB connection and runs their background loops for the
//! lifetime of the process. The HTTP/WebSocket/webhook-receiver surface that
//! would sit in front of this (§1: "treated as external collaborators") is
//! out of scope here; this binary boots the collaborators those adapters
//! would call into (`RetrievalEngine`, `TrainingCoordinator`,
//! `ChatSessionManager`, `WebhookDispatcher`, `ApiGate`) and drives the
//! worker pools that don't need a caller to make progress.

use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use chat_session_manager::ChatSessionManager;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        indexes::ensure_runtime_indexes,
        store::StorageManager,
        types::document::Document,
        vector_store::{SurrealVectorStore, VectorStore},
    },
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{pipeline::IngestionPipeline, run_worker_loop, RawBytesSource};
use retrieval_pipeline::{reranking::RerankerPool, RetrievalEngine};
use std::time::Duration;
use tokio::task::JoinSet;
use training_coordinator::TrainingCoordinator;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use webhook_dispatcher::WebhookDispatcher;

/// Reads a document's raw bytes back from blob storage. `ingest()` itself is
/// storage-agnostic (see `ingestion-pipeline::RawBytesSource`'s doc comment);
/// this binary is the concrete caller that owns both the write side (not
/// exercised here, since uploads arrive through the out-of-scope HTTP
/// boundary) and this read side, keyed the same way: `{kb_id}/{content_hash}`.
struct BlobRawBytesSource {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
}

#[async_trait]
impl RawBytesSource for BlobRawBytesSource {
    async fn read(&self, document_id: &str) -> Result<Vec<u8>, AppError> {
        let document = self
            .db
            .get_item::<Document>(document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;
        let location = format!("{}/{}", document.kb_id, document.content_hash);
        let bytes = self.storage.get(&location).await?;
        Ok(bytes.to_vec())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.apply_migrations().await?;

    let openai_client = Arc::new(Client::with_config(
        OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedding_provider = Arc::new(
        EmbeddingProvider::from_config(&config, Some(Arc::clone(&openai_client))).await?,
    );
    info!(
        embedding_backend = ?config.embedding_backend,
        embedding_dimension = embedding_provider.dimension(),
        "embedding provider initialized"
    );

    ensure_runtime_indexes(&db, embedding_provider.dimension() as usize).await?;

    let storage = StorageManager::new(&config).await?;
    let vector_store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new((*db).clone()));
    let reranker_pool = RerankerPool::maybe_from_config(&config)?;

    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::clone(&db),
        Arc::clone(&embedding_provider),
        Arc::clone(&vector_store),
        reranker_pool,
        &config,
    ));

    let webhook_dispatcher = WebhookDispatcher::new(
        Arc::clone(&db),
        config.webhook_workers,
        config.webhook_queue_capacity,
    );

    let ingestion_pipeline = Arc::new(
        IngestionPipeline::new(
            Arc::clone(&db),
            Arc::clone(&openai_client),
            config.clone(),
            Arc::clone(&embedding_provider),
            Arc::clone(&vector_store),
        )
        .with_webhook_dispatcher(Arc::clone(&webhook_dispatcher)),
    );
    let raw_bytes_source: Arc<dyn RawBytesSource> = Arc::new(BlobRawBytesSource {
        db: Arc::clone(&db),
        storage: storage.clone(),
    });

    let training_coordinator = TrainingCoordinator::new(Arc::clone(&db), config.training_workers);
    let chat_manager = ChatSessionManager::new(
        Arc::clone(&db),
        Arc::clone(&retrieval),
        Arc::clone(&openai_client),
        config.chat_outbound_queue,
        Duration::from_secs(config.chat_idle_timeout_s),
        Some(Arc::clone(&webhook_dispatcher)),
    );
    // `ApiGate` (§4.7) authenticates and rate-limits calls arriving through the
    // out-of-scope external-facing boundary (§1); that boundary constructs and
    // calls it per request, so there is nothing for this process-level
    // entrypoint to drive in the background.

    let mut background = JoinSet::new();
    background.spawn(run_worker_loop(
        Arc::clone(&db),
        Arc::clone(&ingestion_pipeline),
        raw_bytes_source,
    ));
    background.spawn(async move {
        training_coordinator.run_worker_loop().await;
        Ok(())
    });
    background.spawn(async move {
        webhook_dispatcher.run_worker_loop().await;
        Ok(())
    });
    background.spawn(async move {
        chat_manager.run_reaper_loop(Duration::from_secs(60)).await;
        Ok(())
    });

    info!("core process started, running background worker pools");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        Some(result) = background.join_next() => {
            if let Ok(Err(err)) = result {
                error!(error = %err, "a background worker loop exited with an error");
            }
        }
    }

    Ok(())
}
