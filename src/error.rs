//! Error types.

use thiserror::Error;

/// Why a container's labels could not be turned into a routing config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    /// Not an error as such: the container is not managed by us.
    #[error("missing {0} label")]
    MissingRequiredLabel(&'static str),

    #[error("value of '{label}' label is malformed: {reason}")]
    MalformedAddress { label: &'static str, reason: String },

    #[error("value of '{label}' label must be one of 'http', 'https', got '{value}'")]
    InvalidScheme { label: &'static str, value: String },
}

impl LabelError {
    /// Skips are expected for unmanaged containers and are not reported
    /// as failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::MissingRequiredLabel(_))
    }
}

/// Failure talking to one of the registry backends.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("login failed: {0}")]
    Login(String),

    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Failure talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Invalid process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("environment variable '{0}' is not set")]
    Missing(&'static str),

    #[error("environment variable 'RUN_INTERVAL' is invalid: {0}")]
    RunInterval(String),
}
