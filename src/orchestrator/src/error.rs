use thiserror::Error;

/// Errors surfaced by the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Every active host is reserved by another session.
    #[error("no free hosts")]
    NoFreeHosts,
    /// The session was aborted while the file was in flight.
    #[error("aborted while waiting for the result")]
    Timeout,
    /// A file could not be streamed to a remote host.
    #[error("failed to upload {path}: {message}")]
    Upload {
        /// File being uploaded.
        path: String,
        /// OS or transport error.
        message: String,
    },
    /// The worker or its process failed.
    #[error(transparent)]
    Worker(#[from] worker_proc::Error),
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;
