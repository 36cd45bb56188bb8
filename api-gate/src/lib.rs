//! Authenticates and rate-limits every externally-facing call that isn't a
//! user-session HTTP call (§4.7): API-key verification, scope checks and a
//! sliding-window rate limiter, each producing the same `X-RateLimit-*`
//! metadata the caller's HTTP boundary is expected to surface as headers.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::{DateTime, Duration, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::api_key::{ApiKey, Scope},
    },
};

/// Sliding-window result a caller turns into `X-RateLimit-{Limit,Remaining,Reset}`
/// headers (§6) regardless of whether the request was allowed.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds since epoch at which the oldest request in the current window expires.
    pub reset: i64,
}

/// Per-key sliding 1-hour window (§4.7): on each request the window is trimmed
/// of entries older than an hour, then counted. No external rate-limit crate
/// appears anywhere in the corpus, so this stays a `Mutex<HashMap<..>>`, the
/// same idiom `TtlCache` already uses for the in-process caches.
struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Trims the window for `key`, then either admits the request (pushing `now`
    /// onto the window) or rejects it, without mutating the window on rejection.
    fn check(&self, key: &str, limit: u32) -> (bool, RateLimitStatus) {
        let now = Utc::now();
        let cutoff = now - Duration::hours(1);
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let window = windows.entry(key.to_string()).or_default();

        while matches!(window.front(), Some(oldest) if *oldest <= cutoff) {
            window.pop_front();
        }

        let reset = window
            .front()
            .map_or_else(|| (now + Duration::hours(1)).timestamp(), |oldest| (*oldest + Duration::hours(1)).timestamp());

        if window.len() as u32 >= limit {
            return (
                false,
                RateLimitStatus {
                    limit,
                    remaining: 0,
                    reset,
                },
            );
        }

        window.push_back(now);
        let remaining = limit.saturating_sub(window.len() as u32);
        (true, RateLimitStatus { limit, remaining, reset })
    }
}

/// Successful gate check: the verified key plus the rate-limit status to attach
/// to the response regardless of outcome.
pub struct Admission {
    pub api_key: ApiKey,
    pub rate_limit: RateLimitStatus,
}

/// Authenticates and rate-limits API-key-bearing requests (§4.7). One instance
/// is shared process-wide; its rate limiter is independent of the `api_key`
/// table so a revoked-then-reissued key doesn't inherit a stale window.
pub struct ApiGate {
    db: SurrealDbClient,
    limiter: RateLimiter,
    per_ip_limiter: RateLimiter,
    default_ip_limit: u32,
}

impl ApiGate {
    pub fn new(db: SurrealDbClient, default_ip_limit: u32) -> Self {
        Self {
            db,
            limiter: RateLimiter::new(),
            per_ip_limiter: RateLimiter::new(),
            default_ip_limit,
        }
    }

    /// Full gate check for one call: verify the token, check the required scope,
    /// then apply the key's own `requests_per_hour` sliding window. Expired or
    /// revoked keys and missing scopes fail before the rate limiter is touched.
    pub async fn admit(&self, token: &str, required_scope: Scope) -> Result<Admission, AppError> {
        let api_key = ApiKey::verify(&self.db, token).await?;

        if !api_key.has_scope(required_scope) {
            return Err(AppError::PermissionDenied(format!(
                "missing scope {required_scope:?}"
            )));
        }

        let (allowed, rate_limit) = self.limiter.check(&api_key.id, api_key.requests_per_hour);
        if !allowed {
            let retry_after_secs = (rate_limit.reset - Utc::now().timestamp()).max(0) as u64;
            return Err(AppError::RateLimited { retry_after_secs });
        }

        Ok(Admission { api_key, rate_limit })
    }

    /// Per-IP limit (§6 `api_rate_limit_per_ip`), applied independently of any
    /// per-key limit — callers typically check this before `admit` so an
    /// unauthenticated flood doesn't even reach token verification.
    pub fn admit_ip(&self, ip: &str) -> Result<RateLimitStatus, AppError> {
        let (allowed, status) = self.per_ip_limiter.check(ip, self.default_ip_limit);
        if !allowed {
            let retry_after_secs = (status.reset - Utc::now().timestamp()).max(0) as u64;
            return Err(AppError::RateLimited { retry_after_secs });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::api_key::Scope;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("api_gate_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn admits_within_limit_then_rate_limits() {
        let db = test_db().await;
        let issued = ApiKey::issue(&db, "user-1".into(), vec![Scope::Read], 3, None)
            .await
            .expect("issue");
        let gate = ApiGate::new(db, 100);

        for expected_remaining in [2, 1, 0] {
            let admission = gate
                .admit(&issued.plaintext, Scope::Read)
                .await
                .expect("admitted");
            assert_eq!(admission.rate_limit.remaining, expected_remaining);
        }

        let err = gate.admit(&issued.plaintext, Scope::Read).await.unwrap_err();
        match err {
            AppError::RateLimited { retry_after_secs } => assert!(retry_after_secs <= 3600),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_scope_is_rejected_before_rate_limiting() {
        let db = test_db().await;
        let issued = ApiKey::issue(&db, "user-1".into(), vec![Scope::Read], 1, None)
            .await
            .expect("issue");
        let gate = ApiGate::new(db, 100);

        let err = gate.admit(&issued.plaintext, Scope::Admin).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));

        // Scope rejection must not have consumed the window.
        let admission = gate
            .admit(&issued.plaintext, Scope::Read)
            .await
            .expect("admitted");
        assert_eq!(admission.rate_limit.remaining, 0);
    }

    #[tokio::test]
    async fn revoked_key_fails_before_rate_limiting() {
        let db = test_db().await;
        let issued = ApiKey::issue(&db, "user-1".into(), vec![Scope::Read], 10, None)
            .await
            .expect("issue");
        ApiKey::revoke(&db, &issued.api_key.id).await.expect("revoke");
        let gate = ApiGate::new(db, 100);

        let err = gate.admit(&issued.plaintext, Scope::Read).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredential));
    }
}
