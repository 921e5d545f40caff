//! Lifecycle manager: bounded, idempotent container operations.
//!
//! Holds no orchestrator-level locks; every call is pure I/O against the
//! runtime and safe to retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starts, stops and inspects named containers with bounded waits.
#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    start_timeout: Duration,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, start_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            runtime,
            start_timeout,
            stop_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override how often `start` re-inspects while waiting.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Check that the runtime API answers.
    pub async fn ping(&self) -> LifecycleResult<()> {
        self.runtime.ping().await
    }

    /// Current runtime status of a container.
    pub async fn inspect(&self, name: &str) -> LifecycleResult<ContainerInfo> {
        self.runtime.inspect(name).await
    }

    /// Start a container and wait until the runtime reports it running.
    ///
    /// Already running is a no-op success. Fails with `StartTimeout` if the
    /// container is not running before the start timeout.
    pub async fn start(&self, name: &str) -> LifecycleResult<ContainerInfo> {
        let deadline = Instant::now() + self.start_timeout;
        let timed_out = || LifecycleError::StartTimeout {
            name: name.to_string(),
            timeout: self.start_timeout,
        };

        let info = timeout_at(deadline, self.runtime.inspect(name))
            .await
            .map_err(|_| timed_out())??;
        match info.status {
            RuntimeStatus::Running => {
                debug!(container = name, "start skipped, already running");
                return Ok(info);
            }
            RuntimeStatus::Missing => return Err(LifecycleError::NotFound(name.to_string())),
            RuntimeStatus::Starting | RuntimeStatus::Stopped => {}
        }

        if info.status == RuntimeStatus::Stopped {
            timeout_at(deadline, self.runtime.start(name))
                .await
                .map_err(|_| timed_out())??;
        }

        loop {
            let info = timeout_at(deadline, self.runtime.inspect(name))
                .await
                .map_err(|_| timed_out())??;
            match info.status {
                RuntimeStatus::Running => {
                    info!(container = name, id = ?info.id, "container running");
                    return Ok(info);
                }
                RuntimeStatus::Stopped | RuntimeStatus::Missing => {
                    warn!(container = name, status = ?info.status, "container exited during start");
                    return Err(LifecycleError::ExitedDuringStart {
                        name: name.to_string(),
                    });
                }
                RuntimeStatus::Starting => {}
            }

            if Instant::now() + self.poll_interval >= deadline {
                return Err(timed_out());
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Stop a container. Already stopped (or missing) is a no-op success.
    pub async fn stop(&self, name: &str) -> LifecycleResult<()> {
        let deadline = Instant::now() + self.stop_timeout;
        let timed_out = || LifecycleError::StopTimeout {
            name: name.to_string(),
            timeout: self.stop_timeout,
        };

        let info = timeout_at(deadline, self.runtime.inspect(name))
            .await
            .map_err(|_| timed_out())??;
        if matches!(info.status, RuntimeStatus::Stopped | RuntimeStatus::Missing) {
            debug!(container = name, status = ?info.status, "stop skipped, not running");
            return Ok(());
        }

        // Leave the runtime half the budget to shut down gracefully.
        let grace = (self.stop_timeout / 2).max(Duration::from_secs(1));
        match timeout_at(deadline, self.runtime.stop(name, grace)).await {
            Ok(Ok(())) => {
                info!(container = name, "container stopped");
                Ok(())
            }
            Ok(Err(LifecycleError::NotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RuntimeCall, ScriptedRuntime};

    fn manager(runtime: Arc<ScriptedRuntime>) -> LifecycleManager {
        LifecycleManager::new(runtime, Duration::from_secs(5), Duration::from_secs(4))
            .with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web1", RuntimeStatus::Running));
        let info = manager(runtime.clone()).start("web1").await.unwrap();
        assert_eq!(info.status, RuntimeStatus::Running);
        // Already running: no start call reached the runtime.
        assert_eq!(runtime.start_count("web1"), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web1", RuntimeStatus::Stopped));
        manager(runtime.clone()).stop("web1").await.unwrap();
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_missing_container_succeeds() {
        let runtime = Arc::new(ScriptedRuntime::new());
        manager(runtime).stop("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn start_then_stop() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web2", RuntimeStatus::Stopped));
        let mgr = manager(runtime.clone());

        mgr.start("web2").await.unwrap();
        assert_eq!(runtime.status("web2"), RuntimeStatus::Running);

        mgr.stop("web2").await.unwrap();
        assert_eq!(runtime.status("web2"), RuntimeStatus::Stopped);
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Start("web2".to_string()),
                RuntimeCall::Stop("web2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn start_missing_container_is_not_found() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let err = manager(runtime).start("ghost").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_times_out_when_container_never_runs() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web2", RuntimeStatus::Stopped));
        runtime.hang_start("web2");

        let err = manager(runtime.clone()).start("web2").await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartTimeout { .. }));
        assert_eq!(runtime.status("web2"), RuntimeStatus::Starting);
    }

    #[tokio::test]
    async fn start_reports_immediate_exit() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web2", RuntimeStatus::Stopped));
        runtime.crash_on_start("web2");
        let err = manager(runtime).start("web2").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ExitedDuringStart { .. }));
    }

    #[tokio::test]
    async fn unavailable_runtime_propagates() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web1", RuntimeStatus::Stopped));
        runtime.set_available(false);
        let mgr = manager(runtime);
        assert!(mgr.ping().await.unwrap_err().is_unavailable());
        assert!(mgr.start("web1").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn stop_failure_surfaces_error() {
        let runtime = Arc::new(ScriptedRuntime::new().with_container("web1", RuntimeStatus::Running));
        runtime.fail_stop_times("web1", 1);
        let mgr = manager(runtime.clone());

        assert!(mgr.stop("web1").await.is_err());
        // Second attempt goes through.
        mgr.stop("web1").await.unwrap();
        assert_eq!(runtime.status("web1"), RuntimeStatus::Stopped);
    }
}
