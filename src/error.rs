use thiserror::Error;

/// Errors surfaced by the messaging core.
///
/// Handler failures are logged by the event router and never crash the
/// connection; the only fatal error at runtime is a failed listen bind in
/// `main`.
#[derive(Debug, Error)]
pub enum ImError {
    /// The shared store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A payload could not be serialized or deserialized.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Payload encryption or decryption failed.
    #[error("cipher error: {0}")]
    Cipher(String),
}

impl From<redis::RedisError> for ImError {
    fn from(err: redis::RedisError) -> Self {
        ImError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImError>;
