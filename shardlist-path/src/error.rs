pub type Result<T> = std::result::Result<T, PathError>;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("no such path: '{path}'")]
    NotFound { path: String },

    #[error("path already exists: '{path}'")]
    AlreadyExists { path: String },

    #[error("failed to lock '{path}' within {waited_ms} ms")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("lease on '{path}' was lost: {reason}")]
    LockLost { path: String, reason: String },

    #[error("invalid path '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("storage backend error at '{path}': {source}")]
    Backend {
        path: String,
        #[source]
        source: object_store::Error,
    },

    #[error("i/o error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error at '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("operation on '{path}' was cancelled")]
    Cancelled { path: String },
}

impl PathError {
    /// Translate an `object_store` error for the operation on `path`.
    pub(crate) fn from_store(path: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => PathError::NotFound {
                path: path.to_string(),
            },
            object_store::Error::AlreadyExists { .. } => PathError::AlreadyExists {
                path: path.to_string(),
            },
            source => PathError::Backend {
                path: path.to_string(),
                source,
            },
        }
    }
}
