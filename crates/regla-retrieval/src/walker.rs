use std::path::{Path, PathBuf};

use regla_core::{ReglaError, Result};
use tracing::debug;

/// Maximum document size to ingest (64 MB). Regulation volumes run large.
const MAX_FILE_SIZE: u64 = 64 * 1_048_576;

/// Number of bytes to check for binary detection.
const BINARY_CHECK_SIZE: usize = 8192;

/// A text document discovered under the corpus root.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Path relative to the corpus root.
    pub path: PathBuf,
    pub content: String,
}

impl SourceDocument {
    /// Stable document id: the relative path without extension, `/`-separated.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use regla_retrieval::walker::SourceDocument;
    ///
    /// let doc = SourceDocument {
    ///     path: PathBuf::from("tomo-2/capitulo-5.txt"),
    ///     content: String::new(),
    /// };
    /// assert_eq!(doc.doc_id(), "tomo-2/capitulo-5");
    /// ```
    pub fn doc_id(&self) -> String {
        let stem = self.path.with_extension("");
        stem.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walk `root` and read every document whose extension is in `extensions`.
///
/// Respects `.gitignore`/`.ignore` files, skips files over 64 MB, binary
/// files (null bytes in the first 8 KB) and unreadable files. Results are
/// sorted by path.
///
/// # Errors
///
/// Returns [`ReglaError::FileNotFound`] if `root` is not a directory.
pub fn walk_corpus(root: &Path, extensions: &[String]) -> Result<Vec<SourceDocument>> {
    if !root.is_dir() {
        return Err(ReglaError::FileNotFound(root.to_path_buf()));
    }

    let walker = ignore::WalkBuilder::new(root)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    let mut documents = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        let path = entry.path();

        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_lowercase(),
            None => continue,
        };
        if !extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)) {
            continue;
        }

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.len() > MAX_FILE_SIZE {
            debug!(path = %path.display(), "skipping oversized document");
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let check_len = content.len().min(BINARY_CHECK_SIZE);
        if content.as_bytes()[..check_len].contains(&0) {
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => path.to_path_buf(),
        };

        documents.push(SourceDocument {
            path: relative,
            content,
        });
    }

    Ok(documents)
}
