use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{document::ProcessingState, ingestion_job::JobStatus},
        vector_store::{SurrealVectorStore, VectorStore},
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use uuid::Uuid;

use super::IngestionPipeline;

async fn test_pipeline() -> (IngestionPipeline, Arc<SurrealDbClient>) {
    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db"),
    );
    db.apply_migrations().await.expect("migrations");

    let openai_client = Arc::new(Client::with_config(OpenAIConfig::default()));
    let embedding_provider = Arc::new(EmbeddingProvider::new_hashed(16).expect("provider"));
    let vector_store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new((*db).clone()));

    let mut config = AppConfig::default();
    config.chunk_size = 80;
    config.chunk_overlap = 10;
    config.min_line_len = 1;
    config.embedding_batch_size = 2;

    let pipeline = IngestionPipeline::new(db.clone(), openai_client, config, embedding_provider, vector_store);
    (pipeline, db)
}

#[tokio::test]
async fn ingest_rejects_unsupported_format() {
    let (pipeline, _db) = test_pipeline().await;
    let err = pipeline
        .ingest(
            "kb-1",
            b"binary",
            "application/x-made-up",
            "doc".into(),
            "doc.unknown",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UnsupportedFormat(_)));
}

#[tokio::test]
async fn ingest_rejects_oversized_files() {
    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db"),
    );
    db.apply_migrations().await.expect("migrations");
    let openai_client = Arc::new(Client::with_config(OpenAIConfig::default()));
    let embedding_provider = Arc::new(EmbeddingProvider::new_hashed(16).expect("provider"));
    let vector_store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new((*db).clone()));
    let mut config = AppConfig::default();
    config.max_file_size = 10;

    let pipeline = IngestionPipeline::new(db, openai_client, config, embedding_provider, vector_store);

    let err = pipeline
        .ingest(
            "kb-1",
            b"this payload is longer than ten bytes",
            "text/plain",
            "doc".into(),
            "doc.txt",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::FileTooLarge(_)));
}

#[tokio::test]
async fn ingest_rejects_duplicate_content() {
    let (pipeline, _db) = test_pipeline().await;
    let bytes = b"the quick brown fox jumps over the lazy dog";

    pipeline
        .ingest("kb-1", bytes, "text/plain", "doc-1".into(), "doc1.txt", None)
        .await
        .expect("first ingest succeeds");

    let err = pipeline
        .ingest("kb-1", bytes, "text/plain", "doc-2".into(), "doc2.txt", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateContent));
}

#[tokio::test]
async fn ingest_enqueues_a_pending_job() {
    let (pipeline, db) = test_pipeline().await;
    let document = pipeline
        .ingest(
            "kb-1",
            b"some document content",
            "text/plain",
            "doc".into(),
            "doc.txt",
            None,
        )
        .await
        .expect("ingest");

    assert_eq!(document.processing_state, ProcessingState::Pending);

    let job = common::storage::types::ingestion_job::IngestionJob::claim_next(&db, "worker-1", 120)
        .await
        .expect("claim")
        .expect("some job");
    assert_eq!(job.document_id, document.id);
    assert_eq!(job.status, JobStatus::Leased);
}

#[tokio::test]
async fn process_chunks_embeds_and_marks_indexed() {
    let (pipeline, db) = test_pipeline().await;
    let body = "Paragraph one has real content in it.\n\nParagraph two also has real content in it, which is a bit longer than the first one so chunking has something to do.".repeat(3);

    let document = pipeline
        .ingest("kb-1", body.as_bytes(), "text/plain", "doc".into(), "doc.txt", None)
        .await
        .expect("ingest");

    pipeline
        .process(&document, body.as_bytes())
        .await
        .expect("process");

    let updated = db
        .get_item::<common::storage::types::document::Document>(&document.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(updated.processing_state, ProcessingState::Indexed);

    let chunks = common::storage::types::chunk::Chunk::list_for_document(&db, &document.id)
        .await
        .expect("list chunks");
    assert!(!chunks.is_empty());
}

#[tokio::test]
async fn process_failure_marks_document_and_job_failed() {
    let (pipeline, db) = test_pipeline().await;
    let blank = b"   \n\n   \n";
    let document = pipeline
        .ingest("kb-1", blank, "text/plain", "doc".into(), "doc.txt", None)
        .await
        .expect("ingest");

    // Whitespace-only content collapses to nothing once every line is trimmed
    // away, so chunking fails with no chunks produced.
    let job = common::storage::types::ingestion_job::IngestionJob::claim_next(&db, "worker-1", 120)
        .await
        .expect("claim")
        .expect("job");

    let result = pipeline.process_job(&job, blank).await;
    assert!(result.is_err());

    let updated = db
        .get_item::<common::storage::types::document::Document>(&document.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(updated.processing_state, ProcessingState::Failed);
}
