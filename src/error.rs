use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of a coalesced in-flight operation, shared by every waiter.
///
/// The underlying error is reference-counted so that all callers attached to
/// the same execution observe the identical failure.
#[derive(Debug, Clone)]
pub struct SharedOperationError(pub Arc<anyhow::Error>);

impl std::fmt::Display for SharedOperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedOperationError {}

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("circuit '{service}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    #[error("service '{service}' exceeded its deadline after {elapsed:?}")]
    DegradationTimeout { service: String, elapsed: Duration },

    #[error("critical service '{service}' failed with no usable fallback: {cause}")]
    CriticalServiceFailed {
        service: String,
        cause: anyhow::Error,
    },

    #[error("coalesced operation failed: {0}")]
    Coalesced(SharedOperationError),

    #[error("operation failed: {0}")]
    Operation(anyhow::Error),

    #[error("invalid degradation plan: {0}")]
    InvalidPlan(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
