use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

/// One row per (kb, day) recording query volume and latency for dashboards external to
/// this crate; the retrieval engine's "Record" step (§4.4 step 6) writes to this.
stored_object!(UsageCounters, "usage_counters", {
    kb_id: String,
    queries: u64,
    cache_hits: u64,
    latency_ms_sum: u64,
    latency_ms_max: u64,
});

impl UsageCounters {
    pub async fn record_query(
        db: &SurrealDbClient,
        kb_id: &str,
        latency_ms: u64,
        cache_hit: bool,
    ) -> Result<(), AppError> {
        let id = format!("{kb_id}-{}", chrono::Utc::now().format("%Y-%m-%d"));
        let existing: Option<Self> = db.get_item(&id).await?;

        if existing.is_none() {
            let now = chrono::Utc::now();
            db.store_item(UsageCounters {
                id: id.clone(),
                created_at: now,
                updated_at: now,
                kb_id: kb_id.to_string(),
                queries: 0,
                cache_hits: 0,
                latency_ms_sum: 0,
                latency_ms_max: 0,
            })
            .await?;
        }

        db.client
            .query(
                "UPDATE type::thing('usage_counters', $id) SET \
                    queries += 1, \
                    cache_hits += $hit, \
                    latency_ms_sum += $latency, \
                    latency_ms_max = math::max([latency_ms_max, $latency])",
            )
            .bind(("id", id))
            .bind(("hit", if cache_hit { 1 } else { 0 }))
            .bind(("latency", latency_ms))
            .await?;

        Ok(())
    }
}
