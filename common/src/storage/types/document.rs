use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surrealdb::opt::PatchOp;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Docx,
    Xlsx,
    Md,
    Html,
    Txt,
}

impl DocumentKind {
    pub fn from_mime_or_ext(mime: &str, filename: &str) -> Option<Self> {
        let lower_mime = mime.to_lowercase();
        if lower_mime.contains("pdf") {
            return Some(Self::Pdf);
        }
        if lower_mime.contains("wordprocessingml") {
            return Some(Self::Docx);
        }
        if lower_mime.contains("spreadsheetml") {
            return Some(Self::Xlsx);
        }
        if lower_mime.contains("html") {
            return Some(Self::Html);
        }
        if lower_mime == "text/markdown" {
            return Some(Self::Md);
        }
        if lower_mime == "text/plain" {
            return Some(Self::Txt);
        }

        match filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()) {
            Some(ext) if ext == "pdf" => Some(Self::Pdf),
            Some(ext) if ext == "docx" => Some(Self::Docx),
            Some(ext) if ext == "xlsx" => Some(Self::Xlsx),
            Some(ext) if ext == "md" || ext == "markdown" => Some(Self::Md),
            Some(ext) if ext == "html" || ext == "htm" => Some(Self::Html),
            Some(ext) if ext == "txt" => Some(Self::Txt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Parsing,
    Chunked,
    Indexed,
    Failed,
}

stored_object!(Document, "document", {
    kb_id: String,
    title: String,
    #[serde(default)]
    source_url: Option<String>,
    content_hash: String,
    byte_size: u64,
    kind: DocumentKind,
    processing_state: ProcessingState,
    #[serde(default)]
    error_message: Option<String>,
});

impl Document {
    pub fn hash_bytes(raw: &[u8]) -> String {
        let digest = Sha256::digest(raw);
        hex::encode(digest)
    }

    /// `ingest(kb, raw_bytes, mime, title, source_url?)`: validation (format, size,
    /// duplicate-hash) is performed by the caller (`ingestion-pipeline::ingest`) before
    /// this constructor runs; this type only persists the already-validated document.
    pub fn new(
        kb_id: String,
        title: String,
        source_url: Option<String>,
        content_hash: String,
        byte_size: u64,
        kind: DocumentKind,
    ) -> Self {
        let now = chrono::Utc::now();
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kb_id,
            title,
            source_url,
            content_hash,
            byte_size,
            kind,
            processing_state: ProcessingState::Pending,
            error_message: None,
        }
    }

    pub async fn find_by_hash(
        db: &SurrealDbClient,
        kb_id: &str,
        content_hash: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut res = db
            .client
            .query("SELECT * FROM document WHERE kb_id = $kb AND content_hash = $hash LIMIT 1")
            .bind(("kb", kb_id.to_string()))
            .bind(("hash", content_hash.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn list_for_kb(db: &SurrealDbClient, kb_id: &str) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query("SELECT * FROM document WHERE kb_id = $kb ORDER BY created_at ASC")
            .bind(("kb", kb_id.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn get_many(db: &SurrealDbClient, ids: &[String]) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<surrealdb::sql::Thing> = ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from((Self::table_name(), id.as_str())))
            .collect();
        let mut res = db
            .client
            .query("SELECT * FROM document WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn list_unindexed_for_kb(
        db: &SurrealDbClient,
        kb_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut res = db
            .client
            .query(
                "SELECT * FROM document WHERE kb_id = $kb AND processing_state != 'indexed' \
                 ORDER BY created_at ASC",
            )
            .bind(("kb", kb_id.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn set_state(
        db: &SurrealDbClient,
        document_id: &str,
        state: ProcessingState,
    ) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .update((Document::table_name(), document_id))
            .patch(PatchOp::replace("/processing_state", state))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("document {document_id}")))
    }

    pub async fn set_failed(
        db: &SurrealDbClient,
        document_id: &str,
        message: String,
    ) -> Result<Self, AppError> {
        let mut res = db
            .client
            .query(
                "UPDATE type::thing('document', $id) \
                 SET processing_state = 'failed', error_message = $message \
                 RETURN AFTER",
            )
            .bind(("id", document_id.to_string()))
            .bind(("message", message))
            .await?;
        let updated: Option<Self> = res.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("document {document_id}")))
    }
}
