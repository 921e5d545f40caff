//! Health checker service: per-instance probe slots.
//!
//! Each instance owns one slot guarded by an async mutex, so at most one
//! probe per instance is ever in flight. Probes against different
//! instances run concurrently and independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use carousel_core::config::HealthConfig;
use carousel_core::{HealthStatus, epoch_millis};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::checker::{HealthTracker, ProbeResult};
use crate::error::{HealthError, HealthResult};
use crate::probe::HealthProbe;

/// Tunables shared by every slot.
#[derive(Debug, Clone, Copy)]
pub struct CheckerSettings {
    /// Hard ceiling on one probe.
    pub timeout: Duration,
    /// Base probe interval.
    pub interval: Duration,
    pub failure_threshold: u32,
    pub max_backoff: Duration,
}

impl CheckerSettings {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            timeout: config.timeout,
            interval: config.interval,
            failure_threshold: config.failure_threshold,
            max_backoff: config.max_backoff,
        }
    }
}

/// Outcome of one probe, as delivered to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    /// Unix millis at which the probe completed.
    pub checked_at: u64,
    pub probe: ProbeResult,
}

struct Slot {
    name: String,
    address: String,
    tracker: HealthTracker,
    /// Earliest instant the next background probe should run.
    next_due: Option<Instant>,
}

impl Slot {
    async fn run(&mut self, probe: &dyn HealthProbe, settings: &CheckerSettings) -> HealthReport {
        let started = Instant::now();
        let result = match tokio::time::timeout(settings.timeout, probe.probe(&self.address)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(instance = %self.name, timeout = ?settings.timeout, "probe cancelled at timeout");
                ProbeResult::Failed
            }
        };

        let previous = self.tracker.status();
        let status = self.tracker.record(result);
        self.next_due = Some(started + self.tracker.next_interval());

        if status != previous {
            debug!(instance = %self.name, ?previous, ?status, "health status changed");
        }

        HealthReport {
            name: self.name.clone(),
            status,
            consecutive_failures: self.tracker.consecutive_failures(),
            checked_at: epoch_millis(),
            probe: result,
        }
    }
}

/// Probes a fixed set of instances with per-instance thresholds and backoff.
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    settings: CheckerSettings,
    slots: Arc<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl HealthChecker {
    /// Build a checker for `(name, address)` pairs. The instance set is
    /// fixed for the lifetime of the process.
    pub fn new<I>(probe: Arc<dyn HealthProbe>, settings: CheckerSettings, instances: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let slots = instances
            .into_iter()
            .map(|(name, address)| {
                let slot = Slot {
                    name: name.clone(),
                    address,
                    tracker: HealthTracker::new(
                        settings.failure_threshold,
                        settings.interval,
                        settings.max_backoff,
                    ),
                    next_due: None,
                };
                (name, Arc::new(Mutex::new(slot)))
            })
            .collect();

        Self {
            probe,
            settings,
            slots: Arc::new(slots),
        }
    }

    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    fn slot(&self, name: &str) -> HealthResult<Arc<Mutex<Slot>>> {
        self.slots
            .get(name)
            .cloned()
            .ok_or_else(|| HealthError::UnknownInstance(name.to_string()))
    }

    /// Probe one instance now, ignoring backoff.
    ///
    /// Waits for any probe already in flight on the same instance.
    pub async fn check(&self, name: &str) -> HealthResult<HealthReport> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().await;
        Ok(slot.run(self.probe.as_ref(), &self.settings).await)
    }

    /// Probe every named instance that is due, concurrently.
    ///
    /// Instances still in backoff, or with a probe already in flight, are
    /// skipped this round.
    pub async fn sweep(&self, names: &[String]) -> Vec<HealthReport> {
        let now = Instant::now();
        // Tolerate tick jitter so a healthy instance is probed every tick.
        let slack = self.settings.interval / 2;
        let mut set = JoinSet::new();

        for name in names {
            let Some(slot) = self.slots.get(name) else {
                warn!(instance = %name, "sweep skipped unknown instance");
                continue;
            };
            let Ok(mut guard) = slot.clone().try_lock_owned() else {
                debug!(instance = %name, "probe already in flight");
                continue;
            };
            if guard.next_due.is_some_and(|due| now + slack < due) {
                continue;
            }

            let probe = self.probe.clone();
            let settings = self.settings;
            set.spawn(async move { guard.run(probe.as_ref(), &settings).await });
        }

        let mut reports = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Forget an instance's history, e.g. right after it was (re)started.
    pub async fn reset(&self, name: &str) -> HealthResult<()> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().await;
        slot.tracker.reset();
        slot.next_due = None;
        Ok(())
    }

    /// Current tracked status without probing.
    pub async fn status(&self, name: &str) -> HealthResult<HealthStatus> {
        let slot = self.slot(name)?;
        let slot = slot.lock().await;
        Ok(slot.tracker.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    fn settings() -> CheckerSettings {
        CheckerSettings {
            timeout: Duration::from_millis(100),
            interval: Duration::from_secs(1),
            failure_threshold: 2,
            max_backoff: Duration::from_secs(8),
        }
    }

    fn checker(probe: Arc<ScriptedProbe>) -> HealthChecker {
        HealthChecker::new(
            probe,
            settings(),
            [
                ("web1".to_string(), "web1:8080".to_string()),
                ("web2".to_string(), "web2:8080".to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn check_unknown_instance_errors() {
        let checker = checker(Arc::new(ScriptedProbe::new()));
        let err = checker.check("web9").await.unwrap_err();
        assert!(matches!(err, HealthError::UnknownInstance(name) if name == "web9"));
    }

    #[tokio::test]
    async fn check_applies_threshold() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_default("web1:8080", ProbeResult::Unhealthy);
        let checker = checker(probe);

        let first = checker.check("web1").await.unwrap();
        assert_eq!(first.status, HealthStatus::Unknown);
        assert_eq!(first.consecutive_failures, 1);

        let second = checker.check("web1").await.unwrap();
        assert_eq!(second.status, HealthStatus::Unhealthy);
        assert_eq!(second.probe, ProbeResult::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_cut_at_timeout() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_delay("web1:8080", Duration::from_secs(30));
        let checker = checker(probe);

        let started = Instant::now();
        let report = checker.check("web1").await.unwrap();
        assert_eq!(report.probe, ProbeResult::Failed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_instances_in_backoff() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_default("web1:8080", ProbeResult::Failed);
        probe.set_default("web2:8080", ProbeResult::Healthy);
        let checker = checker(probe.clone());
        let names = vec!["web1".to_string(), "web2".to_string()];

        let reports = checker.sweep(&names).await;
        assert_eq!(reports.len(), 2);

        // web1 backed off to 2s, web2 stays on the 1s cadence.
        tokio::time::advance(Duration::from_secs(1)).await;
        let reports = checker.sweep(&names).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "web2");

        tokio::time::advance(Duration::from_secs(1)).await;
        let reports = checker.sweep(&names).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(probe.calls("web1:8080"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_does_not_stack_probes_on_one_instance() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_delay("web1:8080", Duration::from_millis(50));
        let checker = checker(probe.clone());

        let slow = {
            let checker = checker.clone();
            tokio::spawn(async move { checker.check("web1").await })
        };
        tokio::task::yield_now().await;

        let reports = checker.sweep(&["web1".to_string(), "web2".to_string()]).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "web2");

        slow.await.unwrap().unwrap();
        assert_eq!(probe.calls("web1:8080"), 1);
    }

    #[tokio::test]
    async fn reset_returns_to_unknown() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_default("web1:8080", ProbeResult::Failed);
        let checker = checker(probe);

        checker.check("web1").await.unwrap();
        checker.check("web1").await.unwrap();
        assert_eq!(checker.status("web1").await.unwrap(), HealthStatus::Unhealthy);

        checker.reset("web1").await.unwrap();
        assert_eq!(checker.status("web1").await.unwrap(), HealthStatus::Unknown);
    }
}
