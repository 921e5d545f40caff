//! Error types for the telemetry store.

use thiserror::Error;

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors from the persistent rotation history.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
