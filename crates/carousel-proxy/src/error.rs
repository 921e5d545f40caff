//! Error types for proxy reconfiguration.

use std::path::PathBuf;

/// Errors from rendering, validating or applying a proxy configuration.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("refusing to render an empty backend set")]
    EmptyBackendSet,

    #[error("duplicate backend {0}")]
    DuplicateBackend(String),

    #[error("configuration rejected: {0}")]
    Rejected(String),

    #[error("proxy reload failed: {0}")]
    Reload(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
