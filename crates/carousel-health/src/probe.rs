//! The probe seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::checker::{ProbeResult, http_probe};

/// Asks one instance whether it is ready to serve.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// HTTP GET against a fixed path; 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { path, timeout }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        http_probe(address, &self.path, self.timeout).await
    }
}
