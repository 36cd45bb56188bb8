use common::{
    error::AppError, storage::db::SurrealDbClient, storage::types::document::DocumentKind,
    utils::config::AppConfig,
};
use dom_smoothie::{Article, Readability, TextMode};
use std::{env, path::PathBuf};
use tracing::warn;
use uuid::Uuid;

use super::pdf_ingestion::extract_pdf_content;

struct TempPathGuard {
    path: PathBuf,
}

impl Drop for TempPathGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn materialize_temp_pdf(bytes: &[u8]) -> Result<TempPathGuard, AppError> {
    let mut path = env::temp_dir();
    path.push(format!("rag-core-ingest-{}.pdf", Uuid::new_v4()));
    tokio::fs::write(&path, bytes).await?;
    Ok(TempPathGuard { path })
}

/// Format-specific extraction, step 1 of the ingestion pipeline (`extract`). Produces
/// UTF-8 plain text (or Markdown for PDF/HTML) preserving paragraph boundaries; callers
/// run `clean`/`chunk` on the result next.
pub async fn extract_text_from_bytes(
    kind: DocumentKind,
    raw_bytes: &[u8],
    db: &SurrealDbClient,
    openai_client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    config: &AppConfig,
) -> Result<String, AppError> {
    match kind {
        DocumentKind::Txt | DocumentKind::Md => Ok(decode_utf8_lossy(raw_bytes, "txt/md")),
        DocumentKind::Html => extract_html(raw_bytes),
        DocumentKind::Pdf => {
            let guard = materialize_temp_pdf(raw_bytes).await?;
            let result =
                extract_pdf_content(&guard.path, db, openai_client, &config.pdf_ingest_mode).await;
            drop(guard);
            result
        }
        // No DOCX/XLSX reader exists anywhere in the corpus this was built against;
        // best-effort UTF-8 decode is a documented gap, not a silent drop.
        DocumentKind::Docx | DocumentKind::Xlsx => {
            warn!(?kind, "no structured reader available, falling back to raw UTF-8 decode");
            Ok(decode_utf8_lossy(raw_bytes, "docx/xlsx"))
        }
    }
}

fn decode_utf8_lossy(raw_bytes: &[u8], kind_label: &str) -> String {
    match std::str::from_utf8(raw_bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            warn!(kind = kind_label, "input was not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(raw_bytes).into_owned()
        }
    }
}

fn extract_html(raw_bytes: &[u8]) -> Result<String, AppError> {
    let html = decode_utf8_lossy(raw_bytes, "html");
    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = Readability::new(html, None, Some(config))?;
    let article: Article = readability.parse()?;
    Ok(article.text_content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::{config::OpenAIConfig, Client};
    use uuid::Uuid as TestUuid;

    #[tokio::test]
    async fn plain_text_passes_through_unchanged() {
        let config = AppConfig::default();
        let db = SurrealDbClient::memory("test_ns", &TestUuid::new_v4().to_string())
            .await
            .expect("memory db");
        let openai_client = Client::with_config(OpenAIConfig::default());

        let text = extract_text_from_bytes(
            DocumentKind::Txt,
            b"hello world",
            &db,
            &openai_client,
            &config,
        )
        .await
        .expect("extract");

        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn html_is_reduced_to_readable_text() {
        let config = AppConfig::default();
        let db = SurrealDbClient::memory("test_ns", &TestUuid::new_v4().to_string())
            .await
            .expect("memory db");
        let openai_client = Client::with_config(OpenAIConfig::default());

        let html = b"<html><body><article><p>Hello from the article body.</p></article></body></html>";
        let text = extract_text_from_bytes(DocumentKind::Html, html, &db, &openai_client, &config)
            .await
            .expect("extract");

        assert!(text.contains("Hello from the article body"));
    }
}
