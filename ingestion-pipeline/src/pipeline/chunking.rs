use common::error::AppError;
use text_splitter::{ChunkConfig, TextSplitter};

/// Stage 3 of `process` (§4.1 "Chunk"): splits cleaned text into overlapping
/// chunks, preferring paragraph breaks over line breaks over word boundaries
/// over raw characters (the recursive-separator ladder `["\n\n", "\n", " ",
/// ""]`). `text-splitter`'s default character-counted splitter implements this
/// same ladder internally, so this just wires the configured target size and
/// overlap through.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Result<Vec<String>, AppError> {
    if chunk_size == 0 {
        return Err(AppError::Validation("chunk_size must be greater than zero".into()));
    }
    if chunk_overlap >= chunk_size {
        return Err(AppError::Validation(
            "chunk_overlap must be smaller than chunk_size".into(),
        ));
    }

    let config = ChunkConfig::new(chunk_size)
        .with_overlap(chunk_overlap)
        .map_err(|e| AppError::Validation(format!("invalid chunk overlap: {e}")))?;
    let splitter = TextSplitter::new(config);

    let chunks: Vec<String> = splitter.chunks(text).map(str::to_owned).collect();
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_long_text_into_bounded_chunks() {
        let paragraph = "word ".repeat(400);
        let chunks = chunk_text(&paragraph, 200, 20).expect("chunk");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 200 + 20);
        }
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        let err = chunk_text("hello", 10, 10).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn short_text_becomes_a_single_chunk() {
        let chunks = chunk_text("short text", 1000, 100).expect("chunk");
        assert_eq!(chunks, vec!["short text".to_string()]);
    }
}
