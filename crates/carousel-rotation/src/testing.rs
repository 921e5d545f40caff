//! In-process fleet wired to scripted doubles, for crates that drive a
//! running controller through its handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use carousel_core::{PlanId, RotationPlan};
use carousel_health::testing::ScriptedProbe;
use carousel_health::{CheckerSettings, HealthChecker};
use carousel_lifecycle::testing::ScriptedRuntime;
use carousel_lifecycle::{LifecycleManager, RuntimeStatus};
use carousel_proxy::ProxyReconfigurer;
use carousel_proxy::testing::MockDriver;
use carousel_telemetry::{Telemetry, TelemetrySettings};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::{ControllerDeps, ControllerSettings, RotationController};
use crate::handle::RotationHandle;

/// Short timeouts so failure paths finish in milliseconds.
pub fn fast_settings(min_healthy: u32, active_count: u32) -> ControllerSettings {
    ControllerSettings {
        min_healthy,
        active_count,
        quarantine_threshold: 2,
        stop_retry_attempts: 3,
        stop_retry_base: Duration::from_millis(10),
        interval_min: Duration::from_secs(60),
        interval_max: Duration::from_secs(120),
        start_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(2),
        verify_timeout: Duration::from_millis(300),
        proxy_timeout: Duration::from_secs(2),
        runtime_backoff_max: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        standby_cooldown: Duration::from_secs(600),
    }
}

/// Controller task plus the doubles behind it.
pub struct Fleet {
    pub handle: RotationHandle,
    pub runtime: Arc<ScriptedRuntime>,
    pub probe: Arc<ScriptedProbe>,
    pub driver: Arc<MockDriver>,
    pub telemetry: Telemetry,
    pub config_path: PathBuf,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl Fleet {
    /// Bootstrap and run a controller over `names` (one Active, floor of
    /// one). `running` containers start Running, the rest Stopped.
    pub async fn start(names: &[&str], running: &[&str]) -> Self {
        let runtime = names.iter().fold(ScriptedRuntime::new(), |rt, name| {
            let status = if running.contains(name) {
                RuntimeStatus::Running
            } else {
                RuntimeStatus::Stopped
            };
            rt.with_container(name, status)
        });
        let runtime = Arc::new(runtime);
        let probe = Arc::new(ScriptedProbe::new());
        let driver = Arc::new(MockDriver::new());

        let instances: Vec<(String, String)> = names
            .iter()
            .map(|n| (n.to_string(), format!("{n}:8080")))
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("upstream.conf");

        let lifecycle = LifecycleManager::new(runtime.clone(), Duration::from_secs(2), Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(10));
        let health = HealthChecker::new(
            probe.clone(),
            CheckerSettings {
                timeout: Duration::from_millis(200),
                interval: Duration::from_secs(1),
                failure_threshold: 2,
                max_backoff: Duration::from_secs(8),
            },
            instances.clone(),
        );
        let proxy = ProxyReconfigurer::new(driver.clone(), &config_path, "app").unwrap();
        let telemetry = Telemetry::in_memory(TelemetrySettings {
            retention_count: 100,
            retention_window: Duration::from_secs(3600),
            cache_ttl: Duration::ZERO,
        });

        let deps = ControllerDeps {
            lifecycle,
            health,
            proxy,
            telemetry: telemetry.clone(),
            rng: Box::new(StdRng::seed_from_u64(7)),
        };
        let (mut controller, handle) = RotationController::new(fast_settings(1, 1), instances, deps);
        controller.bootstrap().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        Self {
            handle,
            runtime,
            probe,
            driver,
            telemetry,
            config_path,
            shutdown,
            task,
            _dir: dir,
        }
    }

    /// Wait until plan `id` has finished.
    pub async fn wait_for_plan(&self, id: PlanId) -> RotationPlan {
        let mut status = self.handle.subscribe();
        let view = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|v| v.last_plan.as_ref().is_some_and(|p| p.id == id)),
        )
        .await
        .expect("plan did not finish in time")
        .expect("controller stopped");
        view.last_plan.clone().expect("plan present")
    }

    /// Stop the controller task and wait for it to exit.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        (&mut self.task).await.unwrap();
    }
}
