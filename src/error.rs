use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// Stage failures: routed to the chain's fallback, never to the driver
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Execution(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("task was dropped before it reported a result")]
    Abandoned,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Converts a payload caught by `catch_unwind` into a failure.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

// =============================================================================
// Pool errors: surface directly to whoever submitted the work
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker pool needs at least one worker")]
    InvalidSize,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl From<PoolError> for TaskError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Closed => TaskError::PoolClosed,
            other => TaskError::Execution(other.to_string()),
        }
    }
}

// =============================================================================
// Configuration errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
