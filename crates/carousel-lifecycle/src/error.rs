//! Lifecycle error types.

use std::time::Duration;

use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors returned by the container runtime or the lifecycle manager.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("invalid runtime endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container {name} did not report running within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("container {name} did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    #[error("container {name} exited during start")]
    ExitedDuringStart { name: String },

    #[error("runtime API request {uri} got no answer within {timeout:?}")]
    RequestTimeout { uri: String, timeout: Duration },

    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected runtime response: {0}")]
    Decode(String),
}

impl LifecycleError {
    /// The runtime API itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::StartTimeout { .. } | Self::StopTimeout { .. } | Self::RequestTimeout { .. }
        )
    }
}
