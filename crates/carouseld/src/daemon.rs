//! Subsystem wiring and the shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use carousel_api::{ApiState, build_router};
use carousel_core::OrchestratorConfig;
use carousel_health::{CheckerSettings, HealthChecker, HealthMonitor, HttpProbe};
use carousel_lifecycle::{DockerRuntime, LifecycleManager};
use carousel_proxy::{CommandDriver, ProxyReconfigurer};
use carousel_rotation::{
    ControllerDeps, ControllerSettings, JitterSchedule, RotationController, TriggerTimer,
};
use carousel_telemetry::{Telemetry, TelemetrySettings, TelemetryStore};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const REPORT_QUEUE: usize = 8;
const PERSIST_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Seeded from configuration when set, so selection and jitter replay.
fn rng(seed: Option<u64>, stream: u64) -> Box<dyn RngCore + Send + Sync> {
    match seed {
        Some(seed) => Box::new(StdRng::seed_from_u64(seed.wrapping_add(stream))),
        None => Box::new(StdRng::from_entropy()),
    }
}

pub async fn run(config: OrchestratorConfig) -> anyhow::Result<()> {
    info!(
        instances = config.instances.len(),
        min_healthy = config.rotation.min_healthy,
        active_count = config.rotation.active_count,
        "carousel starting"
    );

    let instances: Vec<(String, String)> = config
        .instances
        .iter()
        .map(|inst| (inst.name.clone(), config.instance_address(inst)))
        .collect();

    // ── Initialize subsystems ──────────────────────────────────

    let runtime = Arc::new(DockerRuntime::new(
        &config.runtime.endpoint,
        &config.runtime.api_version,
        config.runtime.request_timeout,
    )?);
    let lifecycle = LifecycleManager::new(runtime, config.timeouts.start, config.timeouts.stop);
    info!(endpoint = %config.runtime.endpoint, "container runtime client ready");

    let probe = Arc::new(HttpProbe::new(config.health.path.clone(), config.health.timeout));
    let health = HealthChecker::new(probe, CheckerSettings::from_config(&config.health), instances.clone());

    let driver = Arc::new(CommandDriver::new(
        config.proxy.validate_command.clone(),
        config.proxy.reload_command.clone(),
    ));
    let proxy = ProxyReconfigurer::new(driver, &config.proxy.config_path, config.proxy.upstream.clone())?;
    info!(path = %config.proxy.config_path.display(), "proxy reconfigurer ready");

    let telemetry_settings = TelemetrySettings::from_config(&config.telemetry);
    let (telemetry, persist) = match &config.telemetry.db_path {
        Some(path) => {
            let store = TelemetryStore::open(path)?;
            let (telemetry, worker) = Telemetry::with_store(telemetry_settings, store)?;
            info!(path = %path.display(), "telemetry store opened");
            (telemetry, Some(worker))
        }
        None => (Telemetry::in_memory(telemetry_settings), None),
    };

    let deps = ControllerDeps {
        lifecycle,
        health: health.clone(),
        proxy,
        telemetry: telemetry.clone(),
        rng: rng(config.rotation.seed, 0),
    };
    let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);
    let (controller, handle) = RotationController::new(ControllerSettings::from_config(&config), instances, deps);
    let mut controller = controller.with_health_reports(report_rx);

    controller.bootstrap().await;

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let persist_handle = persist.map(|worker| tokio::spawn(worker.run()));

    let monitor = HealthMonitor::new(health, config.health.interval);
    let monitor_handle = tokio::spawn(monitor.run(handle.subscribe(), report_tx, shutdown_rx.clone()));

    let controller_handle = tokio::spawn(controller.run(shutdown_rx.clone()));

    let schedule = JitterSchedule::new(config.rotation.interval_min, config.rotation.interval_max);
    let timer = TriggerTimer::new(schedule, rng(config.rotation.seed, 1), handle.clone());
    let timer_handle = tokio::spawn(timer.run(shutdown_rx.clone()));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        rotation: handle.clone(),
        telemetry: telemetry.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.api.listen).await?;
    info!(addr = %config.api.listen, "admin API listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = timer_handle.await;
    let _ = monitor_handle.await;
    let _ = controller_handle.await;

    // The persist worker exits once every telemetry handle is gone.
    drop(handle);
    drop(telemetry);
    if let Some(persist) = persist_handle {
        if tokio::time::timeout(PERSIST_DRAIN_TIMEOUT, persist).await.is_err() {
            warn!("telemetry persistence did not drain before shutdown");
        }
    }

    info!("carousel stopped");
    Ok(())
}
