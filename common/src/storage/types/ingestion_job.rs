use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 120;

/// One unit of work for the training coordinator: "extract+chunk+embed+upsert one
/// document". A KB's training run enqueues one job per unindexed document; the worker
/// pool claims jobs FIFO with a lease so a crashed worker's job is eventually retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Done,
    Failed,
}

stored_object!(IngestionJob, "ingestion_job", {
    kb_id: String,
    document_id: String,
    status: JobStatus,
    attempts: u32,
    #[serde(default)]
    lease_owner: Option<String>,
    #[serde(default)]
    lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    error_message: Option<String>,
});

impl IngestionJob {
    pub fn new(kb_id: String, document_id: String) -> Self {
        let now = chrono::Utc::now();
        IngestionJob {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kb_id,
            document_id,
            status: JobStatus::Pending,
            attempts: 0,
            lease_owner: None,
            lease_expires_at: None,
            error_message: None,
        }
    }

    /// Claims the oldest ready job: either `pending`, or `leased` with an expired lease
    /// and `attempts < MAX_ATTEMPTS`. Uses a single query so the claim is atomic under
    /// SurrealDB's per-statement consistency.
    pub async fn claim_next(
        db: &SurrealDbClient,
        worker_id: &str,
        lease_secs: i64,
    ) -> Result<Option<Self>, AppError> {
        let now = chrono::Utc::now();
        let lease_expires_at = now + chrono::Duration::seconds(lease_secs);

        let mut res = db
            .client
            .query(
                "UPDATE ingestion_job SET status = 'leased', lease_owner = $worker, \
                     lease_expires_at = $expires, attempts += 1 \
                 WHERE (status = 'pending') \
                    OR (status = 'leased' AND lease_expires_at < $now AND attempts < $max_attempts) \
                 ORDER BY created_at ASC LIMIT 1 \
                 RETURN AFTER",
            )
            .bind(("worker", worker_id.to_string()))
            .bind(("expires", surrealdb::sql::Datetime::from(lease_expires_at)))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .bind(("max_attempts", MAX_ATTEMPTS))
            .await?;
        let claimed: Vec<Self> = res.take(0)?;
        Ok(claimed.into_iter().next())
    }

    pub async fn mark_done(db: &SurrealDbClient, id: &str) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query("UPDATE type::thing('ingestion_job', $id) SET status = 'done' RETURN AFTER")
            .bind(("id", id.to_string()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("ingestion job {id}")))
    }

    pub async fn mark_failed(
        db: &SurrealDbClient,
        id: &str,
        message: String,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('ingestion_job', $id) \
                 SET status = 'failed', error_message = $message \
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("message", message))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("ingestion job {id}")))
    }

    pub async fn count_pending_for_kb(db: &SurrealDbClient, kb_id: &str) -> Result<u32, AppError> {
        let mut res = db
            .client
            .query(
                "SELECT count() FROM ingestion_job \
                 WHERE kb_id = $kb AND status IN ['pending', 'leased'] GROUP ALL",
            )
            .bind(("kb", kb_id.to_string()))
            .await?;
        #[derive(Deserialize)]
        struct Count {
            count: u32,
        }
        let count: Option<Count> = res.take(0)?;
        Ok(count.map(|c| c.count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let first = IngestionJob::new("kb-1".into(), "doc-1".into());
        let second = IngestionJob::new("kb-1".into(), "doc-2".into());
        db.store_item(first).await.expect("store first");
        db.store_item(second).await.expect("store second");

        let claimed = IngestionJob::claim_next(&db, "worker-a", 120)
            .await
            .expect("claim")
            .expect("some job");
        assert_eq!(claimed.document_id, "doc-1");
        assert_eq!(claimed.status, JobStatus::Leased);

        let remaining_pending = IngestionJob::count_pending_for_kb(&db, "kb-1")
            .await
            .expect("count");
        assert_eq!(remaining_pending, 2);
    }
}
