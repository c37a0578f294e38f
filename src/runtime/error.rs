//! Error types for engine and request lifecycle failures.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A V8 handle, string or context could not be created.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The engine could not be brought up. Terminal for the engine.
    #[error("engine startup failed: {0}")]
    Startup(String),

    /// Per-request startup failed. The context has already been torn down.
    #[error("request startup failed: {0}")]
    RequestStartupFailed(String),

    #[error("compile failed: {0}")]
    CompileFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The host accepted fewer bytes than were written.
    #[error("connection aborted by client")]
    AbortedConnection,

    /// Another context is registered in the engine's active slot.
    #[error("another context is already active on this engine")]
    ContextBusy,

    #[error("cannot {operation} a context in stage {stage}")]
    InvalidState {
        operation: &'static str,
        stage: &'static str,
    },

    #[error("value conversion failed: {0}")]
    Conversion(String),
}

impl Error {
    /// Compile and execution failures leave the context usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CompileFailed(_) | Error::ExecutionFailed(_) | Error::Conversion(_)
        )
    }
}
