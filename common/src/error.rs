use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error taxonomy shared by every crate in the workspace.
///
/// Variants map onto the business-code table in `business_code()`. A caller at
/// a boundary (HTTP adapter, WebSocket frame, webhook response) translates a
/// variant into whatever wire shape it exposes instead of leaking this type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid credential")]
    InvalidCredential,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("file too large: {0}")]
    FileTooLarge(String),
    #[error("duplicate content")]
    DuplicateContent,
    #[error("training already in progress")]
    TrainingInProgress,
    #[error("knowledge base not ready")]
    KnowledgeBaseNotReady,
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("vector store error: {0}")]
    VectorStoreError(String),
    #[error("cache error: {0}")]
    CacheError(String),
    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("external service error: {0}")]
    ExternalServiceError(String),
    #[error("overloaded")]
    Overloaded,
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),
    #[error("internal service error: {0}")]
    InternalError(String),

    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("task join error: {0}")]
    Join(#[from] JoinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("dom smoothie error: {0}")]
    DomSmoothie(#[from] dom_smoothie::ReadabilityError),
}

impl AppError {
    /// The stable `<DOMAIN>_<NNN>` business code returned alongside every error
    /// response, matching the external response envelope's `error.code` field.
    pub fn business_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "AUTH_001",
            AppError::InvalidCredential => "AUTH_002",
            AppError::PermissionDenied(_) => "AUTH_003",
            AppError::RateLimited { .. } => "AUTH_004",
            AppError::NotFound(_) => "RAG_001",
            AppError::Conflict(_) => "RAG_002",
            AppError::TrainingInProgress => "RAG_003",
            AppError::KnowledgeBaseNotReady => "RAG_004",
            AppError::DuplicateContent => "RAG_005",
            AppError::Validation(_) => "VALID_001",
            AppError::UnsupportedFormat(_) => "VALID_002",
            AppError::FileTooLarge(_) => "VALID_003",
            AppError::ProviderError(_) => "PROV_001",
            AppError::VectorStoreError(_) => "PROV_002",
            AppError::CacheError(_) => "PROV_003",
            AppError::Database(_) => "PROV_004",
            AppError::ExternalServiceError(_) => "PROV_005",
            AppError::OpenAI(_) => "PROV_006",
            AppError::ObjectStore(_) => "PROV_007",
            AppError::Reqwest(_) => "PROV_008",
            AppError::Overloaded => "SYS_001",
            AppError::Canceled => "SYS_002",
            AppError::Timeout => "SYS_003",
            AppError::Configuration(_) => "SYS_004",
            AppError::Join(_) => "SYS_005",
            AppError::Io(_) => "SYS_006",
            AppError::Anyhow(_) => "SYS_007",
            AppError::DomSmoothie(_) => "SYS_008",
            AppError::InternalError(_) => "SYS_999",
        }
    }

    /// Whether this error kind is safe to retry at the call site (embedding
    /// batches, webhook deliveries, vector-store upserts per the local
    /// recovery policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ProviderError(_)
                | AppError::ExternalServiceError(_)
                | AppError::Timeout
                | AppError::Overloaded
                | AppError::Reqwest(_)
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::InternalError(msg.into())
    }
}
