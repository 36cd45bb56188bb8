pub mod chunking;
pub mod clean;
pub mod config;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk,
            document::{Document, DocumentKind, ProcessingState},
            ingestion_job::IngestionJob,
        },
        vector_store::VectorStore,
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use serde_json::json;
use tracing::{error, info, warn};
use webhook_dispatcher::WebhookDispatcher;

pub use config::{IngestionConfig, IngestionTuning};

use crate::utils::file_text_extraction::extract_text_from_bytes;

const SUPPORTED_MIME_HINT: &str = "application/pdf, .docx, .xlsx, .md, .html, .txt";

/// The ingestion + embedding/index builder (§4.1, §4.2): validates and persists
/// uploads (`ingest`), then runs Extract -> Clean -> Chunk -> Persist -> Embed ->
/// Upsert on a claimed document (`process`). The training coordinator drives the
/// worker loop that calls `process_job` for each `IngestionJob` it claims.
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    app_config: AppConfig,
    config: IngestionConfig,
    embedding_provider: Arc<EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    webhook_dispatcher: Option<Arc<WebhookDispatcher>>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        app_config: AppConfig,
        embedding_provider: Arc<EmbeddingProvider>,
        vector_store: Arc<dyn VectorStore>,
    ) -> Self {
        let config = IngestionConfig::from_app_config(&app_config);
        Self {
            db,
            openai_client,
            app_config,
            config,
            embedding_provider,
            vector_store,
            webhook_dispatcher: None,
        }
    }

    /// Attaches the dispatcher `document.uploaded/processed/failed` events
    /// (§4.6) are published through. Left unset in tests, where there are no
    /// subscribers to notify anyway.
    pub fn with_webhook_dispatcher(mut self, dispatcher: Arc<WebhookDispatcher>) -> Self {
        self.webhook_dispatcher = Some(dispatcher);
        self
    }

    /// Fires a `document.*` event if a dispatcher is attached. `publish`
    /// failures (e.g. `Overloaded`) are logged, not propagated: a missed
    /// webhook notification must never fail the document operation that
    /// triggered it.
    async fn notify(&self, event_type: &str, document: &Document) {
        let Some(dispatcher) = &self.webhook_dispatcher else {
            return;
        };
        let data = json!({
            "document_id": document.id,
            "kb_id": document.kb_id,
            "title": document.title,
        });
        if let Err(err) = dispatcher.publish(event_type, data, json!({})).await {
            warn!(document_id = %document.id, event_type, error = %err, "failed to publish webhook event");
        }
    }

    /// `ingest(kb, raw_bytes, mime, title, source_url?) -> Document` (§4.1).
    /// Validates format/size/duplicate-hash and persists a `Pending` document plus
    /// the `IngestionJob` that hands it to a worker; extraction happens in
    /// `process`, not here.
    pub async fn ingest(
        &self,
        kb_id: &str,
        raw_bytes: &[u8],
        mime: &str,
        title: String,
        filename_hint: &str,
        source_url: Option<String>,
    ) -> Result<Document, AppError> {
        let kind = DocumentKind::from_mime_or_ext(mime, filename_hint).ok_or_else(|| {
            AppError::UnsupportedFormat(format!("'{mime}', expected one of {SUPPORTED_MIME_HINT}"))
        })?;

        if raw_bytes.len() as u64 > self.config.max_file_size {
            return Err(AppError::FileTooLarge(format!(
                "{} bytes exceeds the {} byte limit",
                raw_bytes.len(),
                self.config.max_file_size
            )));
        }

        let content_hash = Document::hash_bytes(raw_bytes);
        if Document::find_by_hash(&self.db, kb_id, &content_hash)
            .await?
            .is_some()
        {
            return Err(AppError::DuplicateContent);
        }

        let document = Document::new(
            kb_id.to_string(),
            title,
            source_url,
            content_hash,
            raw_bytes.len() as u64,
            kind,
        );
        let stored: Option<Document> = self.db.store_item(document).await?;
        let document = stored.ok_or_else(|| AppError::internal("failed to persist document"))?;

        let job = IngestionJob::new(kb_id.to_string(), document.id.clone());
        self.db.store_item::<IngestionJob>(job).await?;

        self.notify("document.uploaded", &document).await;

        Ok(document)
    }

    /// Extract -> Clean -> Chunk -> Persist -> Embed -> Upsert (§4.1, §4.2) for a
    /// single document. `raw_bytes` is supplied by the caller (read back from
    /// blob storage); this pipeline has no opinion on where bytes live at rest.
    pub async fn process(&self, document: &Document, raw_bytes: &[u8]) -> Result<(), AppError> {
        let model = self.embedding_provider.model_name().to_string();

        Document::set_state(&self.db, &document.id, ProcessingState::Parsing).await?;
        let extracted = extract_text_from_bytes(
            document.kind,
            raw_bytes,
            &self.db,
            &self.openai_client,
            &self.app_config,
        )
        .await?;

        let cleaned = clean::clean_text(&extracted, self.config.min_line_len);

        let chunk_texts =
            chunking::chunk_text(&cleaned, self.config.chunk_size, self.config.chunk_overlap)?;
        if chunk_texts.is_empty() {
            return Err(AppError::Validation(
                "document produced no chunks after cleaning".into(),
            ));
        }

        let chunks: Vec<Chunk> = chunk_texts
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| {
                Chunk::new(
                    document.id.clone(),
                    document.kb_id.clone(),
                    ordinal as u32,
                    text,
                    Default::default(),
                )
            })
            .collect();
        Chunk::store_all(&self.db, chunks.clone()).await?;
        Document::set_state(&self.db, &document.id, ProcessingState::Chunked).await?;

        self.embed_and_index(&document.kb_id, &model, &chunks)
            .await?;

        Document::set_state(&self.db, &document.id, ProcessingState::Indexed).await?;
        Ok(())
    }

    /// `embed_batch(chunks, model_spec) -> vectors` + `upsert(kb, vectors,
    /// postings)` (§4.2). Groups chunks into `embedding_batch_size`-sized
    /// requests and retries a failing batch with jittered backoff.
    async fn embed_and_index(
        &self,
        kb_id: &str,
        model: &str,
        chunks: &[Chunk],
    ) -> Result<(), AppError> {
        for batch in chunks.chunks(self.config.embedding_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embed_batch_with_retry(&texts).await?;

            for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
                self.vector_store
                    .upsert(kb_id, model, &chunk.id, vector)
                    .await?;
            }
        }
        Ok(())
    }

    async fn embed_batch_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let tuning = &self.config.tuning;
        let mut attempt = 0usize;
        loop {
            match self.embedding_provider.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if attempt + 1 < tuning.embed_retry_attempts && err.is_retryable() => {
                    attempt += 1;
                    let jitter_range = tuning
                        .embed_retry_jitter_max_ms
                        .saturating_sub(tuning.embed_retry_jitter_min_ms)
                        .max(1);
                    let jitter =
                        tuning.embed_retry_jitter_min_ms + (rand::random::<u64>() % jitter_range);
                    let backoff_ms = jitter * 2u64.saturating_pow(attempt as u32);
                    warn!(attempt, error = %err, "embedding batch failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `process` for a claimed job, marking it done or failed depending on
    /// the outcome (the lease itself is owned by whoever called `claim_next`).
    pub async fn process_job(&self, job: &IngestionJob, raw_bytes: &[u8]) -> Result<(), AppError> {
        let document = self
            .db
            .get_item::<Document>(&job.document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {}", job.document_id)))?;

        match self.process(&document, raw_bytes).await {
            Ok(()) => {
                IngestionJob::mark_done(&self.db, &job.id).await?;
                info!(document_id = %document.id, "document indexed");
                self.notify("document.processed", &document).await;
                Ok(())
            }
            Err(err) => {
                Document::set_failed(&self.db, &document.id, err.to_string()).await?;
                IngestionJob::mark_failed(&self.db, &job.id, err.to_string()).await?;
                error!(document_id = %document.id, error = %err, "document processing failed");
                self.notify("document.failed", &document).await;
                Err(err)
            }
        }
    }
}
