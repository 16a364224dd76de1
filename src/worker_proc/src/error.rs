use thiserror::Error;
use wire::Capability;

/// Failures of a worker process or of a request sent to it.
///
/// Cloneable so that one outcome can be handed to every waiter of a promise.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The process could not be started.
    #[error("failed to start worker on {host}: {message}")]
    Spawn {
        /// Host name.
        host: String,
        /// OS error.
        message: String,
    },
    /// The process died or was stopped while the request was pending.
    #[error("process terminated")]
    Terminated,
    /// Writing to or reading from the process failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The process answered with something we do not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The worker rejected a setup request.
    #[error("setup of {capability} failed on {host}: {kind}: {message}")]
    Setup {
        /// Host name.
        host: String,
        /// Capability being set up.
        capability: Capability,
        /// Reason reported by the worker.
        message: String,
        /// Error category reported by the worker.
        kind: String,
    },
    /// The worker failed one inference request. The process stays usable.
    #[error("inference failed on {host}: {kind}: {message}")]
    Inference {
        /// Host name.
        host: String,
        /// Reason reported by the worker.
        message: String,
        /// Error category reported by the worker.
        kind: String,
    },
    /// A closure run on the handle's queue thread failed or panicked.
    #[error("task failed: {0}")]
    Task(String),
}

impl From<wire::Error> for Error {
    fn from(e: wire::Error) -> Self {
        match e {
            wire::Error::Io(_) | wire::Error::Truncated => Error::Transport(e.to_string()),
            _ => Error::Protocol(e.to_string()),
        }
    }
}

/// Result alias for worker operations.
pub type Result<T> = std::result::Result<T, Error>;
