use std::path::PathBuf;

/// Errors that can occur across the regla workspace.
///
/// Retrieval-path failures (`DimensionMismatch`, `IndexUnavailable`,
/// `Provider`, `Timeout`) are recovered at the retriever boundary and turned
/// into [`SearchDiagnostic`](crate::SearchDiagnostic) values. Administrative
/// operations surface them directly.
///
/// # Examples
///
/// ```
/// use regla_core::ReglaError;
///
/// let err = ReglaError::DimensionMismatch { index: 384, provider: 1536 };
/// assert!(err.to_string().contains("384"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ReglaError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration (credentials, endpoints, paths).
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(regla::config),
        help("check .regla.toml or the AZURE_OPENAI_* / OPENAI_API_KEY environment variables")
    )]
    Config(String),

    /// Index vectors and provider vectors have different widths.
    #[error("dimension mismatch: index has {index} dimensions, provider produces {provider}")]
    #[diagnostic(
        code(regla::dimension_mismatch),
        help("run `regla rebuild` with the active embedding provider")
    )]
    DimensionMismatch { index: usize, provider: usize },

    /// The vector index is missing, empty or unreadable.
    #[error("vector index unavailable: {0}")]
    #[diagnostic(code(regla::index_unavailable))]
    IndexUnavailable(String),

    /// An embedding backend failed or returned a malformed response.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// An embedding call exceeded its deadline.
    #[error("embedding provider '{provider}' timed out after {millis}ms")]
    Timeout { provider: String, millis: u64 },

    /// Writing an index artifact failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Document store (SQLite) failure.
    #[error("database error: {0}")]
    Database(String),

    /// Caller supplied inconsistent arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ReglaError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = ReglaError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn dimension_mismatch_names_both_sides() {
        let err = ReglaError::DimensionMismatch {
            index: 384,
            provider: 1536,
        };
        let msg = err.to_string();
        assert!(msg.contains("384"));
        assert!(msg.contains("1536"));
    }

    #[test]
    fn timeout_mentions_provider() {
        let err = ReglaError::Timeout {
            provider: "azure".into(),
            millis: 1500,
        };
        assert_eq!(
            err.to_string(),
            "embedding provider 'azure' timed out after 1500ms"
        );
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = ReglaError::FileNotFound(PathBuf::from("/tmp/vectors.idx"));
        assert!(err.to_string().contains("/tmp/vectors.idx"));
    }
}
