use std::time::Duration;

use thiserror::Error;

/// Failure reported by a completion provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Rate limits, 5xx responses, dropped connections.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Authentication failures and rejected requests. Never retried.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

#[derive(Error, Debug)]
pub enum ClauseBenchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("sample alignment mismatch at index {index}: {left:?} vs {right:?}")]
    Alignment {
        index: usize,
        left: Option<String>,
        right: Option<String>,
    },

    #[error("aggregation invariant violated: {0}")]
    Invariant(String),

    #[error("run '{0}' is incomplete")]
    Incomplete(String),

    #[error("statistics error: {0}")]
    Stats(String),
}

pub type Result<T> = std::result::Result<T, ClauseBenchError>;
