//! Error types for pixelpool-core.

use thiserror::Error;

/// Result type for pixelpool-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pixelpool-core.
///
/// Errors are cloneable because a single pool-wide failure settles many
/// outstanding conversions at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// `submit` was called before `init` completed.
    #[error("worker pool is not initialized")]
    NotInitialized,

    /// The pool has been shut down or torn down after a catastrophic failure.
    #[error("worker pool has been destroyed")]
    Destroyed,

    /// One or more execution contexts failed to start.
    #[error("worker pool failed to initialize: {0}")]
    InitFailed(String),

    /// A single conversion failed inside its execution context.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// An execution context failed without attributing the failure to a request.
    #[error("execution context failed: {0}")]
    ContextFailure(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A message exceeds the frame limit and was not written.
    #[error("IPC message too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl Error {
    /// Whether this error is local to one conversion.
    ///
    /// Callers mark only the affected item as failed for scoped errors and
    /// surface everything else as a pool-wide problem.
    pub fn is_scoped(&self) -> bool {
        matches!(self, Error::Conversion(_))
    }
}
