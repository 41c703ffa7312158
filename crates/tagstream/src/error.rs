//! Common error types for tagstream components.

use thiserror::Error;

/// Common error type for tagstream operations outside the detection engine.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Frame source error (decoding input frames, missing files)
    #[error("frame source error: {0}")]
    Source(String),

    /// Detection pipeline error
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Internal error
    #[error("{0}")]
    Internal(String),
}

/// Result type alias using tagstream Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("fps must be positive".to_string());
        assert_eq!(err.to_string(), "configuration error: fps must be positive");
    }

    #[test]
    fn test_from_serde() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
