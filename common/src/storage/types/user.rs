use surrealdb::opt::PatchOp;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::StoredObject,
    stored_object,
};

stored_object!(User, "user", {
    email: String,
    password: String,
    is_admin: bool,
    is_active: bool,
});

impl User {
    pub fn new(email: String, password_hash: String) -> Self {
        let now = chrono::Utc::now();
        User {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            email: email.to_lowercase(),
            password: password_hash,
            is_admin: false,
            is_active: true,
        }
    }

    /// Self-registration, or admin-created with `is_admin` set explicitly. The very
    /// first user in a fresh deployment becomes admin regardless of the flag passed in.
    pub async fn create_new(
        db: &SurrealDbClient,
        email: String,
        password: String,
        is_admin: bool,
    ) -> Result<Self, AppError> {
        if Self::find_by_email(db, &email).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "a user with email {email} already exists"
            )));
        }

        let existing: Vec<Self> = db.get_all_stored_items().await?;
        let first_user = existing.is_empty();
        let hashed: Option<String> = db
            .client
            .query("RETURN crypto::argon2::generate($password)")
            .bind(("password", password))
            .await?
            .take(0)?;
        let hashed = hashed.ok_or_else(|| AppError::internal("password hashing failed"))?;

        let mut user = User::new(email, hashed);
        user.is_admin = first_user || is_admin;

        let stored: Option<Self> = db.store_item(user).await?;
        stored.ok_or_else(|| AppError::internal("failed to create user"))
    }

    pub async fn find_by_email(
        db: &SurrealDbClient,
        email: &str,
    ) -> Result<Option<Self>, AppError> {
        let email = email.to_lowercase();
        let mut res = db
            .client
            .query("SELECT * FROM user WHERE email = $email LIMIT 1")
            .bind(("email", email))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn authenticate(
        db: &SurrealDbClient,
        email: &str,
        password: &str,
    ) -> Result<Self, AppError> {
        let user = Self::find_by_email(db, email)
            .await?
            .ok_or(AppError::InvalidCredential)?;
        if !user.is_active {
            return Err(AppError::InvalidCredential);
        }

        let matches: Option<bool> = db
            .client
            .query("RETURN crypto::argon2::compare($hash, $password)")
            .bind(("hash", user.password.clone()))
            .bind(("password", password.to_string()))
            .await?
            .take(0)?;

        if matches.unwrap_or(false) {
            Ok(user)
        } else {
            Err(AppError::InvalidCredential)
        }
    }

    /// Soft-delete: sets `is_active = false`. Owned resources are cascaded explicitly
    /// by callers (`KnowledgeBase::delete_cascade`), not implicitly here.
    pub async fn deactivate(db: &SurrealDbClient, user_id: &str) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((User::table_name(), user_id))
            .patch(PatchOp::replace("/is_active", false))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn first_user_becomes_admin() {
        let db = test_db().await;
        let user = User::create_new(&db, "a@example.com".into(), "hunter2".into(), false)
            .await
            .expect("create user");
        assert!(user.is_admin);
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let db = test_db().await;
        User::create_new(&db, "a@example.com".into(), "hunter2".into(), false)
            .await
            .expect("create user");
        let err = User::create_new(&db, "A@example.com".into(), "other".into(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn authenticate_round_trip() {
        let db = test_db().await;
        User::create_new(&db, "a@example.com".into(), "hunter2".into(), false)
            .await
            .expect("create user");
        let user = User::authenticate(&db, "a@example.com", "hunter2")
            .await
            .expect("authenticate");
        assert_eq!(user.email, "a@example.com");
        assert!(User::authenticate(&db, "a@example.com", "wrong")
            .await
            .is_err());
    }
}
