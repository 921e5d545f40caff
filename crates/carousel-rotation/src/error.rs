//! Errors surfaced to callers of the rotation handle.

use thiserror::Error;

pub type RotationResult<T> = Result<T, RotationError>;

/// Why a request to the controller was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// A rotation plan is already in flight.
    #[error("rotation in progress")]
    RotationInProgress,

    /// The container runtime is unreachable and the loop is paused.
    #[error("container runtime unavailable, rotation paused")]
    RuntimeUnavailable,

    /// The controller task is gone.
    #[error("rotation controller stopped")]
    ControllerStopped,

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("instance {0} is not quarantined")]
    NotQuarantined(String),
}
