use crate::error::AppError;

use super::indexes;
use super::types::{system_settings::SystemSettings, StoredObject};
use chrono::Utc;
use futures::Stream;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}
pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// # Initialize a new datbase client
    ///
    /// # Arguments
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Idempotent startup bootstrap: schema definitions, auth, runtime vector/FTS
    /// indexes and the `system_settings` singleton row. Implemented as a plain
    /// re-runnable SurrealQL bootstrap rather than a migration-file runner --
    /// there is nothing in this corpus resembling a migrations directory, and
    /// every `DEFINE ... IF NOT EXISTS` here is already safe to run on every
    /// process start.
    pub async fn apply_migrations(&self) -> Result<(), AppError> {
        self.setup_schema().await?;
        self.setup_auth().await?;

        let embedding_dimension = SystemSettings::ensure_initialized(self)
            .await?
            .default_embedding_dimensions;
        indexes::ensure_runtime_indexes(self, embedding_dimension).await?;

        Ok(())
    }

    async fn setup_schema(&self) -> Result<(), AppError> {
        self.client
            .query(
                "DEFINE TABLE IF NOT EXISTS document SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS chunk SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS embedding SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS knowledge_base SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS kb_membership SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS chat SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS chat_message SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS api_key SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS webhook SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS webhook_delivery SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS ingestion_job SCHEMALESS;
                DEFINE TABLE IF NOT EXISTS usage_counters SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS idx_document_kb ON document FIELDS kb_id;
                DEFINE INDEX IF NOT EXISTS idx_document_hash ON document FIELDS content_hash;
                DEFINE INDEX IF NOT EXISTS idx_chunk_document ON chunk FIELDS document_id;
                DEFINE INDEX IF NOT EXISTS idx_embedding_chunk ON embedding FIELDS chunk_id UNIQUE;
                DEFINE INDEX IF NOT EXISTS idx_membership_kb ON kb_membership FIELDS kb_id;
                DEFINE INDEX IF NOT EXISTS idx_membership_user ON kb_membership FIELDS user_id;
                DEFINE INDEX IF NOT EXISTS idx_chat_kb ON chat FIELDS kb_id;
                DEFINE INDEX IF NOT EXISTS idx_chat_message_chat ON chat_message FIELDS chat_id;
                DEFINE INDEX IF NOT EXISTS idx_api_key_hash ON api_key FIELDS token_hash UNIQUE;
                DEFINE INDEX IF NOT EXISTS idx_webhook_kb ON webhook FIELDS kb_id;
                DEFINE INDEX IF NOT EXISTS idx_job_status ON ingestion_job FIELDS status;
                DEFINE INDEX IF NOT EXISTS idx_job_kb ON ingestion_job FIELDS kb_id;",
            )
            .await?;
        Ok(())
    }

    pub async fn setup_auth(&self) -> Result<(), Error> {
        self.client.query(
        "DEFINE TABLE IF NOT EXISTS user SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS unique_email ON TABLE user FIELDS email UNIQUE;
        DEFINE ACCESS IF NOT EXISTS account ON DATABASE TYPE RECORD
        SIGNUP ( CREATE user SET email = $email, password = crypto::argon2::generate($password), is_admin = false, is_active = true)
        SIGNIN ( SELECT * FROM user WHERE email = $email AND crypto::argon2::compare(password, $password) );",
    )
    .await?;
        Ok(())
    }

    pub async fn rebuild_indexes(&self) -> Result<(), AppError> {
        indexes::rebuild_indexes(self).await
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * `Result` - Vec<T> or Error
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to delete
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
