//! Error types for the remote machine driver.

use thiserror::Error;

/// Result type alias for remote driver operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while driving a remote machine.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("ssh connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("ssh authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },

    #[error("connection limit reached, request dropped")]
    ConnectionLimit,

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("key store error: {0}")]
    Keys(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot determine platform of {host}")]
    PlatformGuess { host: String },

    #[error("command produced no exit status: {command}")]
    NoExitStatus { command: String },

    #[error("engine `{engine}` deploy failed on {host}: {reason}")]
    Deploy {
        engine: String,
        host: String,
        reason: String,
    },
}

impl RemoteError {
    /// Permanent authentication failure: the node must be disabled (and
    /// deallocated when cloud-owned) rather than retried.
    pub fn is_auth_permanent(&self) -> bool {
        matches!(self, RemoteError::AuthRejected { .. })
    }

    /// Worth retrying on a later tick with the node still enabled.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect { .. }
                | RemoteError::ConnectionLimit
                | RemoteError::Ssh(_)
                | RemoteError::Sftp(_)
                | RemoteError::Io(_)
                | RemoteError::NoExitStatus { .. }
        )
    }
}
