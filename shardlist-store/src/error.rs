pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] shardlist_path::PathError),

    #[error(transparent)]
    Serial(#[from] shardlist_serial::SerialError),

    #[error("corrupt manifest at '{path}': {reason}")]
    CorruptManifest { path: String, reason: String },

    #[error("corrupt data file '{path}': {reason}")]
    CorruptData { path: String, reason: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: u64 },

    #[error("indexed access is not supported: {reason}")]
    Unindexable { reason: String },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },

    #[error("failed to write data file '{name}': {reason}")]
    DataFileWrite { name: String, reason: String },

    #[error("unknown column(s) {missing:?}; available: {available:?}")]
    UnknownColumns {
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("parquet error at '{path}': {source}")]
    Parquet {
        path: String,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("arrow error at '{path}': {source}")]
    Arrow {
        path: String,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}
