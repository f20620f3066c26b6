//! Error types for cloud adapters and the coordinator.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur while talking to a cloud provider.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{provider} API error: {reason}")]
    Api {
        provider: &'static str,
        reason: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("created node {ip} not SSH-reachable within {timeout:?}, torn down")]
    CreateTimeout { ip: String, timeout: Duration },

    #[error("{provider} knows no node with ip {ip}")]
    UnknownNode {
        provider: &'static str,
        ip: String,
    },
}
