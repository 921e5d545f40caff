//! Health checker error types.

use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("instance not registered with the health checker: {0}")]
    UnknownInstance(String),
}
