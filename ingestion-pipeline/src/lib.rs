#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use std::sync::Arc;

use common::storage::types::ingestion_job::{IngestionJob, DEFAULT_LEASE_SECS};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionTuning};

/// Reads a raw document's bytes back from wherever `ingest` left them. Left
/// abstract here (rather than taking a `StorageManager` directly) so the worker
/// loop stays agnostic to where `main` wires its blob storage object keys.
#[async_trait::async_trait]
pub trait RawBytesSource: Send + Sync {
    async fn read(&self, document_id: &str) -> Result<Vec<u8>, common::error::AppError>;
}

/// Drives `IngestionPipeline::process_job` against the `ingestion_job` queue:
/// claim the oldest ready job, load its raw bytes, process, repeat. Idles with a
/// short backoff when the queue is empty, matching the lease-based claim
/// already built into `IngestionJob::claim_next`.
pub async fn run_worker_loop(
    db: Arc<common::storage::db::SurrealDbClient>,
    pipeline: Arc<IngestionPipeline>,
    raw_bytes_source: Arc<dyn RawBytesSource>,
) -> Result<(), common::error::AppError> {
    let worker_id = format!("ingestion-worker-{}", Uuid::new_v4());
    let idle_backoff = Duration::from_millis(500);

    loop {
        match IngestionJob::claim_next(&db, &worker_id, DEFAULT_LEASE_SECS).await {
            Ok(Some(job)) => {
                info!(%worker_id, job_id = %job.id, attempts = job.attempts, "claimed ingestion job");
                match raw_bytes_source.read(&job.document_id).await {
                    Ok(raw_bytes) => {
                        if let Err(err) = pipeline.process_job(&job, &raw_bytes).await {
                            error!(%worker_id, job_id = %job.id, error = %err, "ingestion job failed");
                        }
                    }
                    Err(err) => {
                        error!(%worker_id, job_id = %job.id, error = %err, "failed to read raw bytes for job");
                        let _ = IngestionJob::mark_failed(&db, &job.id, err.to_string()).await;
                    }
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim ingestion job");
                warn!("backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
