//! Runtime error types.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors produced by the resource runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A value could not be serialized into a pooled buffer.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The memory probe could not read process memory.
    #[error("memory probe failed: {0}")]
    Probe(String),

    /// The runtime was already shut down.
    #[error("runtime already shut down")]
    ShutDown,
}
