//! Error types shared across the crate.

/// Result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can surface from registration, provisioning, or a call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Terminal failure reported through the logger's `error` channel
    /// (installer or environment creation failed).
    #[error("{0}")]
    Fatal(String),

    /// The worker did not expose its endpoints within the launch ceiling.
    #[error("worker for sandbox '{sandbox}' did not come up within 10s")]
    WorkerLaunch { sandbox: String },

    /// The control or stream connection broke mid-protocol.
    #[error("{0}")]
    Transport(String),

    /// The worker sent something the client does not understand.
    #[error("{0}")]
    Protocol(String),

    /// The remote function raised. The message carries the worker-formatted
    /// traceback; `source()` is the structured remote exception.
    #[error("exception inside sandbox:\n{traceback}")]
    Remote {
        traceback: String,
        #[source]
        cause: RemoteException,
    },

    /// The function could not be registered (unparsable source, no top-level
    /// `def`, invalid dotted path).
    #[error("invalid function: {0}")]
    Registration(String),

    /// The operation is not available on this platform.
    #[error("{0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The exception a worker reported from user code, as `type: message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    /// The Python exception type name, e.g. `ValueError`.
    pub kind: String,
    /// The stringified exception message.
    pub message: String,
}

impl std::fmt::Display for RemoteException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteException {}
