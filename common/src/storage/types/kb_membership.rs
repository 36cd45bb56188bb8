use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Viewer,
    Editor,
    Admin,
    Owner,
}

stored_object!(KbMembership, "kb_membership", {
    kb_id: String,
    user_id: String,
    permission: Permission,
});

impl KbMembership {
    pub fn new(kb_id: String, user_id: String, permission: Permission) -> Self {
        let now = chrono::Utc::now();
        KbMembership {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kb_id,
            user_id,
            permission,
        }
    }

    pub async fn create_owner(
        db: &SurrealDbClient,
        kb_id: &str,
        user_id: &str,
    ) -> Result<Self, AppError> {
        let membership = KbMembership::new(kb_id.to_string(), user_id.to_string(), Permission::Owner);
        let stored: Option<Self> = db.store_item(membership).await?;
        stored.ok_or_else(|| AppError::internal("failed to create membership"))
    }

    pub async fn get(
        db: &SurrealDbClient,
        kb_id: &str,
        user_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut res = db
            .client
            .query("SELECT * FROM kb_membership WHERE kb_id = $kb AND user_id = $user LIMIT 1")
            .bind(("kb", kb_id.to_string()))
            .bind(("user", user_id.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    /// System admins hold implicit owner-level rights on every KB: callers should check
    /// `user.is_admin` before calling this and skip the membership lookup entirely.
    pub async fn require_permission(
        db: &SurrealDbClient,
        kb_id: &str,
        user_id: &str,
        minimum: Permission,
    ) -> Result<Self, AppError> {
        let membership = Self::get(db, kb_id, user_id)
            .await?
            .ok_or_else(|| AppError::PermissionDenied("no membership on knowledge base".into()))?;

        if membership.permission >= minimum {
            Ok(membership)
        } else {
            Err(AppError::PermissionDenied(format!(
                "requires {minimum:?}, has {:?}",
                membership.permission
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn permission_ordering_is_total() {
        assert!(Permission::Owner > Permission::Admin);
        assert!(Permission::Admin > Permission::Editor);
        assert!(Permission::Editor > Permission::Viewer);
    }

    #[tokio::test]
    async fn require_permission_rejects_insufficient_role() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");

        let membership = KbMembership::new("kb-1".into(), "user-1".into(), Permission::Viewer);
        db.store_item(membership).await.expect("store");

        let err = KbMembership::require_permission(&db, "kb-1", "user-1", Permission::Editor)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }
}
