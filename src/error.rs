//! Error types for the generation engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RollingSinkError>;

/// Terminal errors surfaced by the engine. A failed request yields exactly one of these.
#[derive(Error, Debug)]
pub enum RollingSinkError {
    /// Invalid or missing model, weights or configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed request that could not be clamped into range.
    #[error("invalid request: {0}")]
    RequestValidation(String),

    /// Non-finite values or a device failure while denoising or decoding.
    #[error("computation failed during {stage}: {detail}")]
    Computation { stage: String, detail: String },

    /// The request needs more memory than the configured budget.
    #[error(
        "insufficient memory: request needs ~{required_bytes} bytes, budget is {budget_bytes} bytes; \
         reduce the duration to at most {suggested_max_secs:.1}s"
    )]
    ResourceExhaustion {
        required_bytes: u64,
        budget_bytes: u64,
        suggested_max_secs: f64,
    },

    /// Another request is in flight and the admission policy rejects concurrent callers.
    #[error("engine busy: a generation request is already in flight")]
    Busy,

    /// The caller's deadline passed; observed at a block boundary.
    #[error("deadline exceeded after {completed_blocks} completed blocks")]
    DeadlineExceeded { completed_blocks: usize },

    /// Cache inserts must arrive in strictly increasing block order.
    #[error("cache insert out of order: block {index} after block {last}")]
    CacheOrder { index: usize, last: usize },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl RollingSinkError {
    pub fn computation(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        RollingSinkError::Computation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that end only the current request; the engine keeps serving.
    pub fn is_request_scoped(&self) -> bool {
        !matches!(self, RollingSinkError::Configuration(_))
    }
}

impl From<std::io::Error> for RollingSinkError {
    fn from(e: std::io::Error) -> Self {
        RollingSinkError::Configuration(e.to_string())
    }
}

impl From<burn_tensor::DataError> for RollingSinkError {
    fn from(e: burn_tensor::DataError) -> Self {
        RollingSinkError::computation("tensor readback", format!("{e:?}"))
    }
}
