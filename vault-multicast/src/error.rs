//! Error types for multicast announcement and discovery

use thiserror::Error;

/// Result type alias for multicast operations
pub type Result<T> = std::result::Result<T, MulticastError>;

/// Errors raised synchronously to the caller.
///
/// Transient network failures inside a running worker never surface here;
/// they are logged and counted in the worker's metrics instead.
#[derive(Debug, Error)]
pub enum MulticastError {
    /// Creating or configuring a socket failed; the instance must not be used
    #[error("Failed to {stage}: {source}")]
    Socket {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Workers are tokio tasks and need a runtime to be spawned on
    #[error("No tokio runtime available to spawn the worker on")]
    NoRuntime,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Descriptor refused by the registry
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl MulticastError {
    pub(crate) fn socket(stage: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Socket { stage, source }
    }
}

/// Reasons a decoded document is not accepted into the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field '{0}' must be a string")]
    NotAString(&'static str),

    #[error("Service type '{service_type}' does not match filter '{filter}'")]
    Filtered { service_type: String, filter: String },
}
