//! Error types for the response cache and strategy engine

use keepsake_store::StoreError;
use std::io;
use thiserror::Error;

/// Failure reading or writing a cached response record
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Metadata slot does not follow the record format
    #[error("malformed cache record: {0}")]
    Malformed(String),

    /// Payload codec rejected the stored body
    #[error("payload codec error: {0}")]
    Payload(String),
}

impl RecordError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// Failure reported by a network executor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("call canceled")]
    Canceled,
}

/// Invalid call policy or cache configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Strategy tag that is declared but has no semantics
    #[error("strategy `{0}` is reserved and not implemented")]
    ReservedStrategy(&'static str),

    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),

    #[error("unknown time unit `{0}`")]
    UnknownTimeUnit(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by [`crate::CacheEngine`]
#[derive(Error, Debug)]
pub enum EngineError {
    /// `CacheAndNetwork` can produce two results; single-result calls cannot express that
    #[error("strategy `{0}` delivers multiple results and cannot be used with a single-result call")]
    MultipleResultsUnsupported(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The call finished without delivering anything (canceled or the task died)
    #[error("call completed without a delivery")]
    NoDelivery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::MultipleResultsUnsupported("cache_and_network");
        assert!(error.to_string().contains("cache_and_network"));

        let error = ConfigError::ReservedStrategy("cache_and_network_diff");
        assert_eq!(
            error.to_string(),
            "strategy `cache_and_network_diff` is reserved and not implemented"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let error: EngineError = ConfigError::UnknownStrategy("x".into()).into();
        assert!(matches!(error, EngineError::Config(_)));
    }
}
