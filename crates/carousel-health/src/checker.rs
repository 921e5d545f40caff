//! Health check probe logic.
//!
//! Performs HTTP health checks against instance endpoints with
//! configurable thresholds and exponential backoff.

use std::time::Duration;

use carousel_core::HealthStatus;
use tracing::{debug, warn};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    /// Current health status.
    status: HealthStatus,
    /// Consecutive failure count.
    consecutive_failures: u32,
    /// Threshold before marking unhealthy.
    failure_threshold: u32,
    /// Current backoff interval.
    current_backoff: Duration,
    /// Base check interval.
    base_interval: Duration,
    /// Maximum backoff.
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, interval: Duration, max_backoff: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: max_backoff.max(interval),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;

                // First success recovers.
                if self.status != HealthStatus::Healthy {
                    debug!(previous = ?self.status, "instance recovered to healthy");
                }
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;

                // Exponential backoff: double the interval up to max.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.failure_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.failure_threshold,
                            "instance marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    /// Forget all history, as for a freshly started container.
    pub fn reset(&mut self) {
        self.status = HealthStatus::Unknown;
        self.consecutive_failures = 0;
        self.current_backoff = self.base_interval;
    }

    /// Current health status.
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Current number of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current backoff interval before next check.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "carousel-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
