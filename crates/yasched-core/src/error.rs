//! Error types for configuration loading.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the configuration file.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file: {0}")]
    Parse(String),

    #[error("section [{section}]: missing required key `{key}`")]
    MissingKey { section: String, key: String },

    #[error("section [{section}]: invalid value for `{key}`: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: String,
    },

    #[error("engine `{engine}`: {reason}")]
    Engine { engine: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(section: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn engine(engine: &str, reason: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.to_string(),
            reason: reason.into(),
        }
    }
}
