//! Health monitor: background task that sweeps running instances.
//!
//! The monitor reads the controller's published status to decide which
//! containers should be running, probes them through the shared
//! `HealthChecker`, and hands the reports back over a channel. It never
//! writes rotation state itself.

use std::time::Duration;

use carousel_core::{InstanceRole, StatusView};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::service::{HealthChecker, HealthReport};

/// Periodically probes Active and Transitioning instances.
pub struct HealthMonitor {
    checker: HealthChecker,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(checker: HealthChecker, interval: Duration) -> Self {
        Self { checker, interval }
    }

    /// Names the monitor should probe given the latest status.
    pub fn targets(status: &StatusView) -> Vec<String> {
        status
            .instances
            .iter()
            .filter(|i| matches!(i.role, InstanceRole::Active | InstanceRole::Transitioning))
            .map(|i| i.name.clone())
            .collect()
    }

    /// Run until `shutdown` flips or the report channel closes.
    ///
    /// A full report channel drops the batch; the next tick produces a
    /// fresher one.
    pub async fn run(
        self,
        status: watch::Receiver<StatusView>,
        reports: mpsc::Sender<Vec<HealthReport>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let targets = Self::targets(&status.borrow());
                    if targets.is_empty() {
                        continue;
                    }

                    let batch = self.checker.sweep(&targets).await;
                    if batch.is_empty() {
                        continue;
                    }

                    match reports.try_send(batch) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("health report channel full, dropping batch");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("health report receiver gone");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use carousel_core::{HealthStatus, Instance};

    use super::*;
    use crate::checker::ProbeResult;
    use crate::service::CheckerSettings;
    use crate::testing::ScriptedProbe;

    fn status(roles: &[(&str, InstanceRole)]) -> StatusView {
        StatusView {
            instances: roles
                .iter()
                .map(|(name, role)| {
                    let mut inst = Instance::new(name, &format!("{name}:8080"), 0);
                    inst.role = *role;
                    inst
                })
                .collect(),
            current_plan: None,
            last_plan: None,
            min_healthy: 1,
            active_target: 1,
            serving: 0,
            interval_min_ms: 1000,
            interval_max_ms: 2000,
            runtime_paused: false,
            alerts: Vec::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn only_running_roles_are_targets() {
        let view = status(&[
            ("web1", InstanceRole::Active),
            ("web2", InstanceRole::Standby),
            ("web3", InstanceRole::Transitioning),
            ("web4", InstanceRole::Quarantined),
        ]);
        assert_eq!(HealthMonitor::targets(&view), vec!["web1", "web3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_delivers_reports_until_shutdown() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_default("web2:8080", ProbeResult::Unhealthy);
        let checker = HealthChecker::new(
            probe.clone(),
            CheckerSettings {
                timeout: Duration::from_millis(100),
                interval: Duration::from_secs(1),
                failure_threshold: 3,
                max_backoff: Duration::from_secs(4),
            },
            ["web1", "web2", "web3"].map(|n| (n.to_string(), format!("{n}:8080"))),
        );

        let (_status_tx, status_rx) = watch::channel(status(&[
            ("web1", InstanceRole::Active),
            ("web2", InstanceRole::Active),
            ("web3", InstanceRole::Standby),
        ]));
        let (reports_tx, mut reports_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(checker, Duration::from_secs(1));
        let task = tokio::spawn(monitor.run(status_rx, reports_tx, shutdown_rx));

        let batch = reports_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "web1");
        assert_eq!(batch[0].status, HealthStatus::Healthy);
        assert_eq!(batch[1].probe, ProbeResult::Unhealthy);
        assert_eq!(probe.calls("web3:8080"), 0);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
