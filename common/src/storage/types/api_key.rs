use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surrealdb::opt::PatchOp;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

pub const TOKEN_PREFIX: &str = "eak_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
    Webhook,
}

stored_object!(ApiKey, "api_key", {
    owner_user_id: String,
    token_hash: String,
    display_prefix: String,
    scopes: Vec<Scope>,
    requests_per_hour: u32,
    is_active: bool,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    requests_served: u64,
    #[serde(default)]
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
});

/// Token generated and returned once; only the hash is persisted.
pub struct IssuedToken {
    pub plaintext: String,
    pub api_key: ApiKey,
}

impl ApiKey {
    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    pub async fn issue(
        db: &SurrealDbClient,
        owner_user_id: String,
        scopes: Vec<Scope>,
        requests_per_hour: u32,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<IssuedToken, AppError> {
        let plaintext = Self::generate_token();
        let display_prefix = plaintext.chars().take(8).collect();
        let now = chrono::Utc::now();
        let api_key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            owner_user_id,
            token_hash: Self::hash_token(&plaintext),
            display_prefix,
            scopes,
            requests_per_hour,
            is_active: true,
            expires_at,
            requests_served: 0,
            last_used_at: None,
        };

        let stored: Option<Self> = db.store_item(api_key).await?;
        let api_key = stored.ok_or_else(|| AppError::internal("failed to issue api key"))?;
        Ok(IssuedToken { plaintext, api_key })
    }

    /// Verifies an opaque token against the stored hash and records `last_used_at`.
    /// Expired or revoked keys fail with `InvalidCredential` per the gate's contract.
    pub async fn verify(db: &SurrealDbClient, token: &str) -> Result<Self, AppError> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Err(AppError::InvalidCredential);
        }
        let hash = Self::hash_token(token);
        let mut res = db
            .client
            .query("SELECT * FROM api_key WHERE token_hash = $hash LIMIT 1")
            .bind(("hash", hash))
            .await?;
        let key: Option<Self> = res.take(0)?;
        let key = key.ok_or(AppError::InvalidCredential)?;

        if !key.is_active {
            return Err(AppError::InvalidCredential);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at <= chrono::Utc::now() {
                return Err(AppError::InvalidCredential);
            }
        }

        let mut res = db
            .client
            .query(
                "UPDATE type::thing('api_key', $id) \
                 SET requests_served += 1, last_used_at = time::now() \
                 RETURN AFTER",
            )
            .bind(("id", key.id.clone()))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("api key {}", key.id)))
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope) || self.scopes.contains(&Scope::Admin)
    }

    pub async fn revoke(db: &SurrealDbClient, id: &str) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((ApiKey::table_name(), id))
            .patch(PatchOp::replace("/is_active", false))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("api key {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn issue_then_verify_round_trip() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let issued = ApiKey::issue(&db, "user-1".into(), vec![Scope::Read], 100, None)
            .await
            .expect("issue");
        assert!(issued.plaintext.starts_with(TOKEN_PREFIX));

        let verified = ApiKey::verify(&db, &issued.plaintext).await.expect("verify");
        assert_eq!(verified.id, issued.api_key.id);
        assert_eq!(verified.requests_served, 1);
    }

    #[tokio::test]
    async fn revoked_key_fails_verify() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let issued = ApiKey::issue(&db, "user-1".into(), vec![Scope::Read], 100, None)
            .await
            .expect("issue");
        ApiKey::revoke(&db, &issued.api_key.id).await.expect("revoke");

        let err = ApiKey::verify(&db, &issued.plaintext).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredential));
    }
}
