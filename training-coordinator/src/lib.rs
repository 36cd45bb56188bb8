#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Drives every knowledge base through its training lifecycle (§4.3) under
//! bounded concurrency. Document extraction/chunking/embedding itself lives in
//! `ingestion-pipeline`, processed off the shared `ingestion_job` queue by
//! whatever worker loop `main` spawns; this crate owns only the KB-level state
//! machine (`init -> queued -> training -> ready|error|stopped`), FIFO pickup
//! of queued knowledge bases, per-KB cancellation, and progress/ETA tracking.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document::{Document, ProcessingState},
            kb_membership::{KbMembership, Permission},
            knowledge_base::{KnowledgeBase, TrainingStatus},
        },
    },
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How many of a KB's per-document processing times feed the moving average
/// behind `estimated_completion`. The coordinator only observes completion at
/// document granularity (`KnowledgeBase::processed_docs`/`total_docs` are
/// document counts), so this stands in for §4.3's "last 100 chunks" window at
/// the unit this layer actually tracks.
const TIMING_WINDOW: usize = 100;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// `status(kb_id) -> {status, progress, processed, total, estimated_completion, error}`.
#[derive(Debug, Clone)]
pub struct TrainingStatusView {
    pub status: TrainingStatus,
    pub progress: u8,
    pub processed: u32,
    pub total: u32,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

enum Outcome {
    Completed,
    Cancelled,
}

/// Owns the bounded worker pool and the cancellation/ETA bookkeeping for every
/// KB currently `training`. Cheap to clone (an `Arc` internally); share one
/// instance between `train`/`stop_training` callers and the background loop.
pub struct TrainingCoordinator {
    db: Arc<SurrealDbClient>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    eta: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TrainingCoordinator {
    pub fn new(db: Arc<SurrealDbClient>, max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            db,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel_tokens: Mutex::new(HashMap::new()),
            eta: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_poll_interval(db: Arc<SurrealDbClient>, max_workers: usize, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            poll_interval,
            cancel_tokens: Mutex::new(HashMap::new()),
            eta: Mutex::new(HashMap::new()),
        })
    }

    /// `train(kb_id, actor)` (§4.3): requires `editor+`; rejects with
    /// `TrainingInProgress` if already queued/training, otherwise transitions
    /// the KB to `queued`. The background loop picks it up FIFO.
    pub async fn train(&self, kb_id: &str, actor_user_id: &str) -> Result<KnowledgeBase, AppError> {
        KbMembership::require_permission(&self.db, kb_id, actor_user_id, Permission::Editor).await?;
        KnowledgeBase::request_training(&self.db, kb_id).await
    }

    /// `stop_training(kb_id, actor)` (§4.3): requires `editor+`; transitions to
    /// `stopped` immediately and signals the in-flight job's cancellation token,
    /// if one is currently running for this KB.
    pub async fn stop_training(&self, kb_id: &str, actor_user_id: &str) -> Result<KnowledgeBase, AppError> {
        KbMembership::require_permission(&self.db, kb_id, actor_user_id, Permission::Editor).await?;
        let kb = KnowledgeBase::stop_training(&self.db, kb_id).await?;
        if let Some(token) = self.cancel_tokens.lock().expect("cancel token mutex poisoned").get(kb_id) {
            token.cancel();
        }
        Ok(kb)
    }

    pub async fn status(&self, kb_id: &str) -> Result<TrainingStatusView, AppError> {
        let kb = KnowledgeBase::get(&self.db, kb_id).await?;
        let estimated_completion = if kb.training_status == TrainingStatus::Training {
            self.eta.lock().expect("eta mutex poisoned").get(kb_id).copied()
        } else {
            None
        };
        Ok(TrainingStatusView {
            status: kb.training_status,
            progress: kb.training_progress,
            processed: kb.processed_docs,
            total: kb.total_docs,
            estimated_completion,
            error: kb.error_message,
        })
    }

    /// Runs forever: waits for a free worker slot, claims the oldest queued KB
    /// that's still queued by the time it wins the `transition_to_training`
    /// CAS, then drives it to completion. Meant to be spawned once per process
    /// per `training_workers` budget (the semaphore already enforces the
    /// bound, so a single call covers the whole pool).
    pub async fn run_worker_loop(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match self.claim_next_queued().await {
                Ok(Some((kb, total_docs))) => {
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        coordinator.run_training_job(kb, total_docs, permit).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) => {
                    drop(permit);
                    error!(error = %err, "failed to scan for queued knowledge bases");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn claim_next_queued(&self) -> Result<Option<(KnowledgeBase, u32)>, AppError> {
        let candidates = KnowledgeBase::list_queued(&self.db).await?;
        for candidate in candidates {
            let total_docs = Document::list_unindexed_for_kb(&self.db, &candidate.id).await?.len() as u32;
            match KnowledgeBase::transition_to_training(&self.db, &candidate.id, total_docs).await {
                Ok(kb) => return Ok(Some((kb, total_docs))),
                Err(AppError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn run_training_job(
        self: Arc<Self>,
        kb: KnowledgeBase,
        total_docs: u32,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let kb_id = kb.id.clone();
        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .expect("cancel token mutex poisoned")
            .insert(kb_id.clone(), token.clone());

        let result = self.drive_training(&kb_id, total_docs, &token).await;

        self.cancel_tokens.lock().expect("cancel token mutex poisoned").remove(&kb_id);
        self.eta.lock().expect("eta mutex poisoned").remove(&kb_id);

        match result {
            Ok(Outcome::Completed) => match KnowledgeBase::mark_ready(&self.db, &kb_id).await {
                Ok(_) => info!(%kb_id, "training completed"),
                Err(err) => error!(%kb_id, error = %err, "failed to mark knowledge base ready"),
            },
            Ok(Outcome::Cancelled) => info!(%kb_id, "training stopped"),
            Err(err) => {
                warn!(%kb_id, error = %err, "training failed");
                if let Err(mark_err) = KnowledgeBase::mark_error(&self.db, &kb_id, err.to_string()).await {
                    error!(%kb_id, error = %mark_err, "failed to mark knowledge base errored");
                }
            }
        }
    }

    /// Polls the KB's unindexed-document count down to zero, recording
    /// progress and a per-document moving-average ETA as it goes. Checked for
    /// cancellation (both an explicit `stop_training` call and a status raced
    /// out from under it) once per tick, which is this layer's natural stage
    /// boundary since the parse/chunk/embed/upsert stages themselves run
    /// out-of-process in `ingestion-pipeline`.
    async fn drive_training(
        &self,
        kb_id: &str,
        total_docs: u32,
        token: &CancellationToken,
    ) -> Result<Outcome, AppError> {
        let mut timings: VecDeque<Duration> = VecDeque::with_capacity(TIMING_WINDOW);
        let mut last_processed = 0u32;
        let mut last_tick = Instant::now();

        loop {
            if token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            tokio::time::sleep(self.poll_interval).await;

            let kb = KnowledgeBase::get(&self.db, kb_id).await?;
            if kb.training_status != TrainingStatus::Training {
                return Ok(Outcome::Cancelled);
            }

            let unindexed = Document::list_unindexed_for_kb(&self.db, kb_id).await?;
            if let Some(failed) = unindexed.iter().find(|d| d.processing_state == ProcessingState::Failed) {
                let message = failed
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("document {} failed to index", failed.id));
                return Err(AppError::ProviderError(message));
            }

            let remaining = unindexed.len() as u32;
            let processed = total_docs.saturating_sub(remaining);

            if processed != last_processed {
                let elapsed = last_tick.elapsed();
                let advanced = processed.saturating_sub(last_processed).max(1);
                let per_doc = elapsed / advanced;
                if timings.len() == TIMING_WINDOW {
                    timings.pop_front();
                }
                timings.push_back(per_doc);
                last_processed = processed;
                last_tick = Instant::now();

                KnowledgeBase::record_progress(&self.db, kb_id, processed).await?;
                self.record_eta(kb_id, &timings, remaining);
            }

            if remaining == 0 {
                return Ok(Outcome::Completed);
            }
        }
    }

    fn record_eta(&self, kb_id: &str, timings: &VecDeque<Duration>, remaining: u32) {
        if timings.is_empty() || remaining == 0 {
            self.eta.lock().expect("eta mutex poisoned").remove(kb_id);
            return;
        }
        let total: Duration = timings.iter().sum();
        let avg = total / timings.len() as u32;
        let eta = avg.saturating_mul(remaining);
        let completion = Utc::now()
            + chrono::Duration::from_std(eta).unwrap_or_else(|_| chrono::Duration::zero());
        self.eta.lock().expect("eta mutex poisoned").insert(kb_id.to_string(), completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::{
        document::DocumentKind,
        knowledge_base::LlmConfig,
        StoredObject,
    };
    use uuid::Uuid;

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        Arc::new(db)
    }

    async fn make_kb(db: &SurrealDbClient, owner: &str) -> KnowledgeBase {
        KnowledgeBase::create_with_owner(
            db,
            owner.to_string(),
            "kb".into(),
            "general".into(),
            LlmConfig::default(),
        )
        .await
        .expect("create kb")
    }

    #[tokio::test]
    async fn train_requires_editor_permission() {
        let db = test_db().await;
        let kb = make_kb(&db, "owner-1").await;
        let coordinator = TrainingCoordinator::new(Arc::clone(&db), 2);

        let err = coordinator.train(&kb.id, "stranger").await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn train_then_retrain_is_rejected_while_queued() {
        let db = test_db().await;
        let kb = make_kb(&db, "owner-1").await;
        let coordinator = TrainingCoordinator::new(Arc::clone(&db), 2);

        coordinator.train(&kb.id, "owner-1").await.expect("first train");
        let err = coordinator.train(&kb.id, "owner-1").await.unwrap_err();
        assert!(matches!(err, AppError::TrainingInProgress));
    }

    #[tokio::test]
    async fn worker_loop_drives_an_empty_kb_straight_to_ready() {
        let db = test_db().await;
        let kb = make_kb(&db, "owner-1").await;
        let coordinator =
            TrainingCoordinator::with_poll_interval(Arc::clone(&db), 2, Duration::from_millis(10));

        coordinator.train(&kb.id, "owner-1").await.expect("train");

        let worker = tokio::spawn(Arc::clone(&coordinator).run_worker_loop());

        let mut status = coordinator.status(&kb.id).await.expect("status");
        for _ in 0..50 {
            if status.status == TrainingStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = coordinator.status(&kb.id).await.expect("status");
        }
        assert_eq!(status.status, TrainingStatus::Ready);
        worker.abort();
    }

    #[tokio::test]
    async fn stop_training_cancels_an_in_flight_run() {
        let db = test_db().await;
        let kb = make_kb(&db, "owner-1").await;

        let document = Document::new(
            kb.id.clone(),
            "doc".into(),
            None,
            Document::hash_bytes(b"content"),
            7,
            DocumentKind::Txt,
        );
        db.store_item(document).await.expect("store document");

        let coordinator =
            TrainingCoordinator::with_poll_interval(Arc::clone(&db), 2, Duration::from_millis(10));
        coordinator.train(&kb.id, "owner-1").await.expect("train");

        let worker = tokio::spawn(Arc::clone(&coordinator).run_worker_loop());

        let mut status = coordinator.status(&kb.id).await.expect("status");
        for _ in 0..50 {
            if status.status == TrainingStatus::Training {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = coordinator.status(&kb.id).await.expect("status");
        }
        assert_eq!(status.status, TrainingStatus::Training);

        coordinator.stop_training(&kb.id, "owner-1").await.expect("stop");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = coordinator.status(&kb.id).await.expect("status");
        assert_eq!(status.status, TrainingStatus::Stopped);
        worker.abort();
    }
}
