use super::config::AppConfig;
use crate::error::AppError;
use crate::storage::types::document::DocumentKind;

/// Runs before a `Document` is ever constructed (ingestion-pipeline's intake stage,
/// SPEC_FULL §4.1 step 1): format allow-list, size ceiling, and per-request batch
/// limits. Mirrors `AppError`'s `UnsupportedFormat`/`FileTooLarge` variants directly
/// rather than a separate validation-error enum, since every failure here is already
/// a taxonomy member a caller needs to map to an HTTP status.
pub fn validate_upload(
    config: &AppConfig,
    mime: &str,
    filename: &str,
    byte_size: u64,
    files_in_request: usize,
) -> Result<DocumentKind, AppError> {
    if files_in_request > config.ingest_max_files {
        return Err(AppError::Validation(format!(
            "too many files in one request, maximum is {}",
            config.ingest_max_files
        )));
    }

    if byte_size > config.max_file_size {
        return Err(AppError::FileTooLarge(format!(
            "{filename} is {byte_size} bytes, maximum is {}",
            config.max_file_size
        )));
    }

    DocumentKind::from_mime_or_ext(mime, filename)
        .ok_or_else(|| AppError::UnsupportedFormat(format!("{filename} ({mime})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_many_files() {
        let config = AppConfig {
            ingest_max_files: 1,
            ..Default::default()
        };
        let result = validate_upload(&config, "text/plain", "a.txt", 10, 2);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn rejects_oversized_file() {
        let config = AppConfig {
            max_file_size: 4,
            ..Default::default()
        };
        let result = validate_upload(&config, "text/plain", "a.txt", 100, 1);
        assert!(matches!(result, Err(AppError::FileTooLarge(_))));
    }

    #[test]
    fn rejects_unsupported_format() {
        let config = AppConfig::default();
        let result = validate_upload(&config, "application/octet-stream", "a.bin", 10, 1);
        assert!(matches!(result, Err(AppError::UnsupportedFormat(_))));
    }

    #[test]
    fn accepts_valid_upload() {
        let config = AppConfig::default();
        let result = validate_upload(&config, "text/plain", "a.txt", 10, 1);
        assert!(matches!(result, Ok(DocumentKind::Txt)));
    }
}
