//! Document ingestion into the retrieval backend.

use crate::chunker::chunk;
use crate::config::IngestConfig;
use crate::error::{RagError, RetrievalError};
use crate::retrieval::RetrievalBackend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Counters reported after an ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub files_indexed: usize,
    pub chunks_indexed: usize,
    pub files_failed: usize,
}

/// Why a single file was skipped.
#[derive(Debug, thiserror::Error)]
enum FileError {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("insert failed after {inserted} chunk(s): {source}")]
    Insert {
        inserted: usize,
        source: RetrievalError,
    },
}

/// Chunk one file and insert its chunks in order. Returns the chunk count.
async fn ingest_file(
    path: &Path,
    backend: &dyn RetrievalBackend,
    size: usize,
    overlap: usize,
) -> Result<usize, FileError> {
    let content = tokio::fs::read_to_string(path).await?;
    // Parameters are validated by the caller.
    let chunks = chunk(&content, size, overlap).unwrap_or_default();
    for (inserted, piece) in chunks.iter().enumerate() {
        backend
            .insert(piece)
            .await
            .map_err(|source| FileError::Insert { inserted, source })?;
    }
    Ok(chunks.len())
}

/// Index every matching file under `dir`.
///
/// Files are visited in sorted path order and their chunks inserted one at a
/// time. A file that cannot be read or indexed is logged, counted in
/// [`IngestStats::files_failed`], and skipped.
pub async fn ingest_directory(
    dir: &Path,
    backend: &dyn RetrievalBackend,
    config: &IngestConfig,
) -> Result<IngestStats, RagError> {
    // Reject bad parameters once, before touching the filesystem.
    chunk("", config.chunk_size, config.chunk_overlap)?;

    if !dir.is_dir() {
        return Err(RagError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("documents directory not found: {}", dir.display()),
        )));
    }

    let mut stats = IngestStats::default();
    let walker = walkdir::WalkDir::new(dir).sort_by_file_name();
    for entry in walker.into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| config.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)));
        if !matches {
            continue;
        }

        match ingest_file(entry.path(), backend, config.chunk_size, config.chunk_overlap).await {
            Ok(chunks) => {
                debug!(path = %entry.path().display(), chunks, "Indexed file");
                stats.files_indexed += 1;
                stats.chunks_indexed += chunks;
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping file");
                stats.files_failed += 1;
            }
        }
    }

    info!(
        dir = %dir.display(),
        files = stats.files_indexed,
        chunks = stats.chunks_indexed,
        failed = stats.files_failed,
        "Ingestion complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkError;
    use crate::retrieval::MockRetrieval;
    use pretty_assertions::assert_eq;

    fn small_config() -> IngestConfig {
        IngestConfig {
            chunk_size: 10,
            chunk_overlap: 2,
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_directory_indexes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "short doc").unwrap();
        std::fs::write(dir.path().join("skip.md"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.TXT"), "abcdefghijklmnop").unwrap();

        let backend = MockRetrieval::empty();
        let stats = ingest_directory(dir.path(), &backend, &small_config())
            .await
            .unwrap();

        assert_eq!(
            stats,
            IngestStats {
                files_indexed: 2,
                chunks_indexed: 3,
                files_failed: 0,
            }
        );
        assert_eq!(
            backend.inserted(),
            vec!["short doc", "abcdefghij", "ijklmnop"]
        );
    }

    #[tokio::test]
    async fn test_unreadable_file_is_counted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.txt"), [0xffu8, 0xfe, 0x00]).unwrap();
        std::fs::write(dir.path().join("good.txt"), "fine").unwrap();

        let backend = MockRetrieval::empty();
        let stats = ingest_directory(dir.path(), &backend, &small_config())
            .await
            .unwrap();
        assert_eq!(stats.files_indexed, 1);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(backend.inserted(), vec!["fine"]);
    }

    #[tokio::test]
    async fn test_backend_failure_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "doc").unwrap();

        let stats = ingest_directory(dir.path(), &MockRetrieval::unavailable(), &small_config())
            .await
            .unwrap();
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.files_indexed, 0);
    }

    #[tokio::test]
    async fn test_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = ingest_directory(&missing, &MockRetrieval::empty(), &small_config()).await;
        assert!(matches!(result, Err(RagError::Io(_))));
    }

    #[tokio::test]
    async fn test_invalid_chunk_parameters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            chunk_size: 4,
            chunk_overlap: 4,
            ..IngestConfig::default()
        };
        let result = ingest_directory(dir.path(), &MockRetrieval::empty(), &config).await;
        assert!(matches!(
            result,
            Err(RagError::Chunk(ChunkError::OverlapTooLarge { .. }))
        ));
    }
}
