pub type Result<T> = std::result::Result<T, SerialError>;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("unknown storage format: '{name}'")]
    UnknownFormat { name: String },

    #[error("storage format '{format}' does not take a compression codec")]
    UnsupportedCodec { format: String },

    #[error("cannot infer a schema for '{format}' from an empty batch")]
    EmptyBatch { format: String },

    #[error("failed to encode a {format} batch: {reason}")]
    Encode { format: String, reason: String },

    #[error("failed to decode a {format} batch: {reason}")]
    Decode { format: String, reason: String },
}
