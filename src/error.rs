//! Error taxonomy for the engine.
//!
//! One variant per abstract kind from the error handling design: the engine
//! never panics on malformed external input, it returns `ValidationFailure`.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("guard rejected by hook {hook_id}")]
    GuardRejection { hook_id: String },

    #[error("handler {hook_id} timed out")]
    HandlerTimeout { hook_id: String },

    #[error("binding failure: {0}")]
    BindingFailure(String),

    #[error("task failure: {0}")]
    TaskFailure(String),

    #[error("operation timed out")]
    Timeout,

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("task {0} not enabled")]
    NotEnabled(String),

    #[error("unknown id: {0}")]
    Unknown(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::ValidationFailure(format!("json error: {err}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::StorageFailure(err.to_string())
    }
}
