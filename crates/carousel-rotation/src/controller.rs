//! Rotation controller: drives the rotation state machine.
//!
//! A single task owns `RotationState` and consumes one command channel.
//! Health reports, background stop results and runtime re-pings arrive
//! on their own channels and are applied between cycles.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use carousel_core::{
    Alert, AvailabilitySample, FailureReason, HealthStatus, InstanceRole, OrchestratorConfig,
    PlanId, PlanOutcome, RotationPhase, RotationPlan, StatusView, Trigger, epoch_millis,
};
use carousel_health::{HealthChecker, HealthReport};
use carousel_lifecycle::{LifecycleError, LifecycleManager, LifecycleResult, RuntimeStatus};
use carousel_proxy::{Backend, ProxyReconfigurer};
use carousel_telemetry::Telemetry;
use rand::RngCore;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{RotationError, RotationResult};
use crate::handle::{Command, RotationHandle};
use crate::selection;
use crate::state::RotationState;

const MAX_ALERTS: usize = 32;
const COMMAND_QUEUE: usize = 16;
const STOP_RETRY_MAX: Duration = Duration::from_secs(60);
const RUNTIME_BACKOFF_BASE: Duration = Duration::from_secs(1);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of a component's own timeout before the phase deadline fires.
const DEADLINE_MARGIN: Duration = Duration::from_secs(1);

/// Knobs the controller reads from configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub min_healthy: u32,
    pub active_count: u32,
    pub quarantine_threshold: u32,
    pub stop_retry_attempts: u32,
    /// First delay of the background stop retry; doubles per attempt.
    pub stop_retry_base: Duration,
    pub interval_min: Duration,
    pub interval_max: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub verify_timeout: Duration,
    pub proxy_timeout: Duration,
    pub runtime_backoff_max: Duration,
    pub poll_interval: Duration,
    pub standby_cooldown: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            min_healthy: config.rotation.min_healthy,
            active_count: config.rotation.active_count,
            quarantine_threshold: config.rotation.quarantine_threshold,
            stop_retry_attempts: config.rotation.stop_retry_attempts,
            stop_retry_base: Duration::from_secs(1),
            interval_min: config.rotation.interval_min,
            interval_max: config.rotation.interval_max,
            start_timeout: config.timeouts.start,
            stop_timeout: config.timeouts.stop,
            verify_timeout: config.timeouts.verify,
            proxy_timeout: config.timeouts.proxy,
            runtime_backoff_max: config.timeouts.runtime_backoff_max,
            poll_interval: config.health.poll_interval,
            standby_cooldown: config.health.standby_cooldown,
        }
    }
}

/// Collaborators the controller drives.
pub struct ControllerDeps {
    pub lifecycle: LifecycleManager,
    pub health: HealthChecker,
    pub proxy: ProxyReconfigurer,
    pub telemetry: Telemetry,
    /// Source for candidate and retiring-instance choice.
    pub rng: Box<dyn RngCore + Send + Sync>,
}

/// Result of a background stop retry.
#[derive(Debug)]
struct StopOutcome {
    name: String,
    result: StopResult,
    attempts: u32,
}

#[derive(Debug)]
enum StopResult {
    Stopped,
    /// Every attempt failed while the runtime kept answering.
    Failed,
    /// The runtime stopped answering; the stop waits for it to return.
    RuntimeDown(String),
}

#[derive(Debug)]
struct Pause {
    backoff: Duration,
    next_ping: Instant,
}

/// The rotation state machine and its single owner.
pub struct RotationController {
    state: RotationState,
    settings: ControllerSettings,
    lifecycle: LifecycleManager,
    health: HealthChecker,
    proxy: ProxyReconfigurer,
    telemetry: Telemetry,
    rng: Box<dyn RngCore + Send + Sync>,
    commands: mpsc::Receiver<Command>,
    health_rx: Option<mpsc::Receiver<Vec<HealthReport>>>,
    stop_tx: mpsc::Sender<StopOutcome>,
    stop_rx: mpsc::Receiver<StopOutcome>,
    busy: Arc<AtomicBool>,
    status_tx: watch::Sender<StatusView>,
    next_plan_id: PlanId,
    last_plan: Option<RotationPlan>,
    alerts: VecDeque<Alert>,
    pause: Option<Pause>,
    /// Stops put off while the runtime is unreachable.
    deferred_stops: BTreeSet<String>,
}

impl RotationController {
    /// Build a controller for `(name, address)` instances.
    pub fn new<I>(settings: ControllerSettings, instances: I, deps: ControllerDeps) -> (Self, RotationHandle)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let state = RotationState::new(
            instances,
            settings.min_healthy,
            settings.active_count,
            (settings.interval_min, settings.interval_max),
            epoch_millis(),
        );
        let next_plan_id = deps.telemetry.last_plan_id().map_or(1, |id| id + 1);

        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (stop_tx, stop_rx) = mpsc::channel(COMMAND_QUEUE);
        let busy = Arc::new(AtomicBool::new(false));
        let (status_tx, _) = watch::channel(empty_view());

        let controller = Self {
            state,
            settings,
            lifecycle: deps.lifecycle,
            health: deps.health,
            proxy: deps.proxy,
            telemetry: deps.telemetry,
            rng: deps.rng,
            commands,
            health_rx: None,
            stop_tx,
            stop_rx,
            busy: busy.clone(),
            status_tx,
            next_plan_id,
            last_plan: None,
            alerts: VecDeque::new(),
            pause: None,
            deferred_stops: BTreeSet::new(),
        };
        controller.publish();

        let handle = RotationHandle::new(commands_tx, busy, controller.status_tx.subscribe());
        (controller, handle)
    }

    /// Consume health reports from a monitor.
    pub fn with_health_reports(mut self, rx: mpsc::Receiver<Vec<HealthReport>>) -> Self {
        self.health_rx = Some(rx);
        self
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    // ── Loop ──────────────────────────────────────────────────────

    /// Process commands, health reports, stop results and runtime
    /// re-pings until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instances = self.state.names().len(),
            min_healthy = self.state.min_healthy,
            "rotation controller started"
        );

        loop {
            let ping_at = self.pause.as_ref().map(|p| p.next_ping);

            tokio::select! {
                _ = shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                batch = recv_optional(&mut self.health_rx) => match batch {
                    Some(batch) => self.apply_health(batch),
                    None => self.health_rx = None,
                },
                Some(outcome) = self.stop_rx.recv() => self.handle_stop_outcome(outcome).await,
                _ = sleep_until_optional(ping_at) => self.retry_runtime().await,
            }
        }

        info!("rotation controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Rotate { trigger, reply } => {
                let id = self.allocate_plan_id();
                self.busy.store(true, Ordering::Release);
                let answer = if self.pause.is_some() {
                    Err(RotationError::RuntimeUnavailable)
                } else {
                    Ok(id)
                };
                let _ = reply.send(answer);
                self.execute(id, trigger).await;
                self.reject_queued().await;
                self.busy.store(false, Ordering::Release);
            }
            Command::ClearQuarantine { name, reply } => {
                let result = self.clear_quarantine(&name).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Triggers that queued up during a cycle are rejected, never run.
    async fn reject_queued(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Rotate { trigger, reply } => {
                    debug!(?trigger, "rejecting trigger received during cycle");
                    let _ = reply.send(Err(RotationError::RotationInProgress));
                }
                Command::ClearQuarantine { name, reply } => {
                    let result = self.clear_quarantine(&name).await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    // ── Startup ───────────────────────────────────────────────────

    /// Reconcile with what the runtime is already running, fill the
    /// Active set up to the target and point the proxy at it.
    ///
    /// Never fails; problems are logged and left to later cycles.
    pub async fn bootstrap(&mut self) {
        info!(instances = self.state.names().len(), "reconciling with container runtime");
        if let Err(e) = self.ping().await {
            self.enter_pause(&e);
            return;
        }

        let mut running = Vec::new();
        for name in self.state.names() {
            match timeout(PING_TIMEOUT, self.lifecycle.inspect(&name)).await {
                Ok(Ok(info)) => {
                    if let Some(inst) = self.state.instance_mut(&name) {
                        inst.id = info.id.clone();
                    }
                    match info.status {
                        RuntimeStatus::Running | RuntimeStatus::Starting => running.push(name),
                        RuntimeStatus::Missing => warn!(instance = %name, "container does not exist"),
                        RuntimeStatus::Stopped => {}
                    }
                }
                Ok(Err(e)) if e.is_unavailable() => {
                    self.enter_pause(&e);
                    return;
                }
                Ok(Err(e)) => warn!(instance = %name, error = %e, "inspect failed"),
                Err(_) => warn!(instance = %name, "inspect timed out"),
            }
        }

        let target = self.state.active_target as usize;
        let now = epoch_millis();
        for name in running.iter().take(target) {
            self.state.set_role(name, InstanceRole::Active, now);
        }
        for name in running.iter().skip(target) {
            info!(instance = %name, "stopping extra running container");
            self.stop_to_standby(name).await;
        }
        for name in self.state.active_set() {
            if !self.verify(&name).await {
                warn!(instance = %name, "running instance not healthy at startup");
            }
        }

        let mut tried = HashSet::new();
        while self.state.count_role(InstanceRole::Active) < self.state.active_target {
            let now = epoch_millis();
            self.expire_standby_health(now);
            let pool: Vec<String> = selection::eligible_candidates(&self.state)
                .into_iter()
                .filter(|n| !tried.contains(n))
                .collect();
            let Some(name) = pool.choose(&mut *self.rng).cloned() else {
                warn!(
                    active = self.state.count_role(InstanceRole::Active),
                    target = self.state.active_target,
                    "not enough eligible instances to reach the active target"
                );
                break;
            };
            tried.insert(name.clone());

            self.state.set_role(&name, InstanceRole::Transitioning, now);
            match timeout(self.settings.start_timeout + DEADLINE_MARGIN, self.lifecycle.start(&name)).await {
                Ok(Ok(info)) => {
                    if let Some(inst) = self.state.instance_mut(&name) {
                        inst.id = info.id;
                    }
                }
                Ok(Err(e)) => {
                    warn!(instance = %name, error = %e, "failed to start instance at startup");
                    self.stop_to_standby(&name).await;
                    continue;
                }
                Err(_) => {
                    warn!(instance = %name, "start timed out at startup");
                    self.stop_to_standby(&name).await;
                    continue;
                }
            }

            self.state.set_role(&name, InstanceRole::Active, epoch_millis());
            if !self.verify(&name).await {
                warn!(instance = %name, "started instance failed health verification");
                self.stop_to_standby(&name).await;
            }
        }

        let backends = self.backends_without(None);
        if backends.is_empty() {
            warn!("no healthy active instance, proxy configuration left unchanged");
        } else if let Err(detail) = self.cut_over(backends).await {
            self.alert(None, Some(FailureReason::ProxyReloadFailure), format!("startup proxy apply failed: {detail}"));
        }

        self.record_availability();
        self.state.check_invariant("bootstrap");
        info!(active = ?self.state.active_set(), serving = self.state.serving_count(), "reconciliation complete");
        self.publish();
    }

    // ── Cycle ─────────────────────────────────────────────────────

    /// Run one rotation cycle to completion.
    pub async fn run_cycle(&mut self, trigger: Trigger) -> RotationPlan {
        let id = self.allocate_plan_id();
        self.busy.store(true, Ordering::Release);
        let plan = self.execute(id, trigger).await;
        self.busy.store(false, Ordering::Release);
        plan
    }

    async fn execute(&mut self, id: PlanId, trigger: Trigger) -> RotationPlan {
        let mut plan = RotationPlan::begin(id, trigger, self.state.active_set(), epoch_millis());
        info!(plan = id, ?trigger, active = ?plan.from_active, "rotation cycle started");
        self.state.check_invariant("cycle start");
        self.track(&plan);

        if self.pause.is_some() {
            return self.finish(
                plan,
                PlanOutcome::Failed,
                Some(FailureReason::RuntimeApiUnavailable),
                Some("rotation paused while the runtime is unreachable".to_string()),
            );
        }
        if let Err(e) = self.ping().await {
            self.enter_pause(&e);
            return self.finish(
                plan,
                PlanOutcome::Failed,
                Some(FailureReason::RuntimeApiUnavailable),
                Some(e.to_string()),
            );
        }

        // SelectingCandidate
        self.expire_standby_health(epoch_millis());
        let Some(candidate) = selection::choose_candidate(&self.state, &mut *self.rng) else {
            warn!(plan = id, "no eligible standby candidate, skipping cycle");
            return self.finish(plan, PlanOutcome::Failed, Some(FailureReason::NoEligibleCandidate), None);
        };
        // Below the active target the cycle only adds.
        let retiring = if self.state.count_role(InstanceRole::Active) >= self.state.active_target {
            selection::choose_retiring(&self.state, &mut *self.rng)
        } else {
            None
        };
        plan.candidate = Some(candidate.clone());
        plan.retiring = retiring.clone();
        plan.to_active.insert(candidate.clone());
        if let Some(name) = &retiring {
            plan.to_active.remove(name);
        }
        info!(plan = id, candidate = %candidate, retiring = ?retiring, "candidate selected");

        // StartingCandidate
        self.state.set_role(&candidate, InstanceRole::Transitioning, epoch_millis());
        self.enter_phase(&mut plan, RotationPhase::StartingCandidate);
        let limit = self.settings.start_timeout + DEADLINE_MARGIN;
        match timeout(limit, self.lifecycle.start(&candidate)).await {
            Ok(Ok(info)) => {
                if let Some(inst) = self.state.instance_mut(&candidate) {
                    inst.id = info.id;
                }
            }
            Ok(Err(e)) if e.is_unavailable() => {
                self.enter_pause(&e);
                return self.roll_back(plan, FailureReason::RuntimeApiUnavailable, e.to_string()).await;
            }
            Ok(Err(e)) if e.is_timeout() => {
                return self.roll_back(plan, FailureReason::ContainerStartTimeout, e.to_string()).await;
            }
            Ok(Err(e)) => {
                return self.roll_back(plan, FailureReason::StartFailure, e.to_string()).await;
            }
            Err(_) => {
                let detail = format!("start of {candidate} exceeded {limit:?}");
                return self.roll_back(plan, FailureReason::ContainerStartTimeout, detail).await;
            }
        }

        // VerifyingCandidate: old and new are both Active from here on.
        self.state.set_role(&candidate, InstanceRole::Active, epoch_millis());
        self.enter_phase(&mut plan, RotationPhase::VerifyingCandidate);
        if !self.verify(&candidate).await {
            let detail = format!(
                "{candidate} not healthy within {:?}",
                self.settings.verify_timeout
            );
            return self.roll_back(plan, FailureReason::HealthCheckTimeout, detail).await;
        }

        // CuttingOverProxy
        self.enter_phase(&mut plan, RotationPhase::CuttingOverProxy);
        let retiring = match retiring {
            Some(name) if !self.state.can_retire(&name) => {
                warn!(
                    plan = id,
                    instance = %name,
                    serving = self.state.serving_count(),
                    min_healthy = self.state.min_healthy,
                    "keeping retiring instance, stopping it would breach the serving floor"
                );
                plan.retiring = None;
                plan.to_active.insert(name);
                None
            }
            other => other,
        };
        let backends = self.backends_without(retiring.as_deref());
        if let Err(detail) = self.cut_over(backends).await {
            return self.roll_back(plan, FailureReason::ProxyReloadFailure, detail).await;
        }

        // StoppingPrevious
        if let Some(name) = retiring {
            self.enter_phase(&mut plan, RotationPhase::StoppingPrevious);
            self.state.set_role(&name, InstanceRole::Transitioning, epoch_millis());
            self.publish();
            self.stop_to_standby(&name).await;
        }

        if let Some(inst) = self.state.instance_mut(&candidate) {
            inst.rotation_failures = 0;
        }
        self.finish(plan, PlanOutcome::Success, None, None)
    }

    /// Undo a cycle: restore the proxy, stop the candidate, count the
    /// failure against it.
    async fn roll_back(&mut self, mut plan: RotationPlan, reason: FailureReason, detail: String) -> RotationPlan {
        warn!(plan = plan.id, %reason, %detail, "rolling back rotation");
        self.enter_phase(&mut plan, RotationPhase::RollingBack);

        match timeout(self.settings.proxy_timeout, self.proxy.restore()).await {
            Ok(Ok(true)) => info!(plan = plan.id, "pre-cycle proxy configuration restored"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(plan = plan.id, alert = true, error = %e, "failed to restore proxy configuration"),
            Err(_) => error!(plan = plan.id, alert = true, "proxy restore timed out"),
        }

        if let Some(candidate) = plan.candidate.clone() {
            let now = epoch_millis();
            self.state.set_role(&candidate, InstanceRole::Transitioning, now);

            let quarantine = match self.state.instance_mut(&candidate) {
                Some(inst) => {
                    if reason.counts_against_candidate() {
                        inst.rotation_failures += 1;
                    }
                    inst.rotation_failures >= self.settings.quarantine_threshold
                }
                None => false,
            };

            let stopped = self.stop_or_defer(&candidate).await;
            if quarantine {
                warn!(
                    plan = plan.id,
                    instance = %candidate,
                    threshold = self.settings.quarantine_threshold,
                    "candidate quarantined after repeated failures"
                );
                self.state.set_role(&candidate, InstanceRole::Quarantined, epoch_millis());
            } else if stopped {
                self.state.set_role(&candidate, InstanceRole::Standby, epoch_millis());
            }
        }

        self.finish(plan, PlanOutcome::RolledBack, Some(reason), Some(detail))
    }

    fn finish(
        &mut self,
        mut plan: RotationPlan,
        outcome: PlanOutcome,
        reason: Option<FailureReason>,
        detail: Option<String>,
    ) -> RotationPlan {
        plan.finish(outcome, reason, detail, epoch_millis());
        match outcome {
            PlanOutcome::Success => info!(
                plan = plan.id,
                duration_ms = plan.duration_ms(),
                active = ?plan.to_active,
                "rotation cycle succeeded"
            ),
            _ => warn!(
                plan = plan.id,
                ?outcome,
                reason = ?plan.reason,
                detail = ?plan.detail,
                "rotation cycle did not succeed"
            ),
        }

        if let Some(reason) = reason.filter(|r| r.is_alert()) {
            let message = plan.detail.clone().unwrap_or_else(|| reason.to_string());
            self.alert(Some(plan.id), Some(reason), message);
        }

        self.state.current_plan = None;
        self.state.check_invariant("cycle end");
        self.last_plan = Some(plan.clone());
        self.telemetry.record(plan.clone());
        self.record_availability();
        self.publish();
        plan
    }

    // ── Phase helpers ─────────────────────────────────────────────

    fn allocate_plan_id(&mut self) -> PlanId {
        let id = self.next_plan_id;
        self.next_plan_id += 1;
        id
    }

    fn track(&mut self, plan: &RotationPlan) {
        self.state.current_plan = Some(plan.clone());
        self.publish();
    }

    fn enter_phase(&mut self, plan: &mut RotationPlan, phase: RotationPhase) {
        plan.phase = phase;
        info!(plan = plan.id, ?phase, "rotation phase");
        self.track(plan);
    }

    /// Poll the candidate until Healthy or the verify deadline.
    async fn verify(&mut self, name: &str) -> bool {
        if let Err(e) = self.health.reset(name).await {
            warn!(instance = name, error = %e, "cannot verify instance");
            return false;
        }

        let deadline = Instant::now() + self.settings.verify_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, self.health.check(name)).await {
                Ok(Ok(report)) => {
                    let healthy = report.status == HealthStatus::Healthy;
                    self.apply_report(&report);
                    if healthy {
                        debug!(instance = name, "instance verified healthy");
                        return true;
                    }
                }
                Ok(Err(e)) => {
                    warn!(instance = name, error = %e, "health check failed");
                    return false;
                }
                Err(_) => return false,
            }

            self.drain_health_reports();
            self.publish();

            let nap = self
                .settings
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            if nap.is_zero() {
                return false;
            }
            sleep(nap).await;
        }
    }

    fn backends_without(&self, excluded: Option<&str>) -> Vec<Backend> {
        self.state
            .healthy_actives()
            .into_iter()
            .filter(|(name, _)| Some(name.as_str()) != excluded)
            .map(|(name, address)| Backend::new(name, address))
            .collect()
    }

    /// Render, validate and apply under the proxy deadline.
    async fn cut_over(&mut self, backends: Vec<Backend>) -> Result<(), String> {
        let config = self.proxy.render(backends);
        let limit = self.settings.proxy_timeout;
        let proxy = &mut self.proxy;
        let result = timeout(limit, async move {
            let validated = proxy.validate(config).await?;
            proxy.apply(validated).await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("proxy cutover exceeded {limit:?}")),
        }
    }

    async fn try_stop(&self, name: &str) -> LifecycleResult<()> {
        let limit = self.settings.stop_timeout + DEADLINE_MARGIN;
        let result = match timeout(limit, self.lifecycle.stop(name)).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::StopTimeout {
                name: name.to_string(),
                timeout: limit,
            }),
        };
        if let Err(e) = &result {
            warn!(instance = name, error = %e, "stop failed");
        }
        result
    }

    /// Stop `name` now. A failed stop goes to the background retry; while
    /// the runtime is unreachable the stop waits until it answers again.
    ///
    /// Returns whether the container is stopped.
    async fn stop_or_defer(&mut self, name: &str) -> bool {
        if self.pause.is_some() {
            self.defer_stop(name);
            return false;
        }
        match self.try_stop(name).await {
            Ok(()) => true,
            Err(e) if e.is_unavailable() => {
                self.enter_pause(&e);
                self.defer_stop(name);
                false
            }
            Err(_) => {
                self.spawn_stop_retry(name.to_string());
                false
            }
        }
    }

    fn defer_stop(&mut self, name: &str) {
        if self.deferred_stops.insert(name.to_string()) {
            info!(instance = name, "stop deferred until the container runtime is reachable");
        }
    }

    /// Stop `name` and return it to Standby, or leave it Transitioning
    /// until a retried or deferred stop goes through.
    async fn stop_to_standby(&mut self, name: &str) {
        self.state.set_role(name, InstanceRole::Transitioning, epoch_millis());
        if self.stop_or_defer(name).await {
            self.mark_stopped(name).await;
        }
    }

    async fn mark_stopped(&mut self, name: &str) {
        let now = epoch_millis();
        if let Some(inst) = self.state.instance_mut(name) {
            inst.set_health(HealthStatus::Unknown, now);
            inst.consecutive_failures = 0;
        }
        self.state.set_role(name, InstanceRole::Standby, now);
        let _ = self.health.reset(name).await;
    }

    fn spawn_stop_retry(&self, name: String) {
        let lifecycle = self.lifecycle.clone();
        let tx = self.stop_tx.clone();
        let attempts = self.settings.stop_retry_attempts;
        let mut backoff = self.settings.stop_retry_base;

        info!(instance = %name, attempts, "retrying stop in background");
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                sleep(backoff).await;
                let result = match lifecycle.stop(&name).await {
                    Ok(()) => StopResult::Stopped,
                    Err(e) if e.is_unavailable() => StopResult::RuntimeDown(e.to_string()),
                    Err(e) => {
                        warn!(instance = %name, attempt, error = %e, "stop retry failed");
                        backoff = (backoff * 2).min(STOP_RETRY_MAX);
                        continue;
                    }
                };
                let _ = tx
                    .send(StopOutcome {
                        name,
                        result,
                        attempts: attempt,
                    })
                    .await;
                return;
            }
            let _ = tx
                .send(StopOutcome {
                    name,
                    result: StopResult::Failed,
                    attempts,
                })
                .await;
        });
    }

    async fn handle_stop_outcome(&mut self, outcome: StopOutcome) {
        let role = self.state.instance(&outcome.name).map(|i| i.role);
        match outcome.result {
            StopResult::Stopped => {
                info!(instance = %outcome.name, attempts = outcome.attempts, "background stop succeeded");
                if role == Some(InstanceRole::Transitioning) {
                    self.mark_stopped(&outcome.name).await;
                }
            }
            StopResult::RuntimeDown(detail) => {
                warn!(instance = %outcome.name, %detail, "stop retry interrupted by runtime outage");
                self.enter_pause(&LifecycleError::Unavailable(detail));
                self.defer_stop(&outcome.name);
            }
            StopResult::Failed => {
                self.state
                    .set_role(&outcome.name, InstanceRole::Quarantined, epoch_millis());
                self.alert(
                    None,
                    None,
                    format!(
                        "container {} could not be stopped after {} attempts, quarantined",
                        outcome.name, outcome.attempts
                    ),
                );
            }
        }
        self.publish();
    }

    /// Wait for the next background stop result and apply it.
    ///
    /// Returns the instance name and whether it stopped. Used when driving
    /// the controller without `run`.
    pub async fn next_stop_outcome(&mut self) -> Option<(String, bool)> {
        let outcome = self.stop_rx.recv().await?;
        let result = (outcome.name.clone(), matches!(outcome.result, StopResult::Stopped));
        self.handle_stop_outcome(outcome).await;
        Some(result)
    }

    /// Stops waiting for the runtime to come back.
    pub fn deferred_stops(&self) -> impl Iterator<Item = &str> {
        self.deferred_stops.iter().map(String::as_str)
    }

    async fn resume_deferred_stops(&mut self) {
        for name in std::mem::take(&mut self.deferred_stops) {
            let transitioning = self
                .state
                .instance(&name)
                .is_some_and(|i| i.role == InstanceRole::Transitioning);
            info!(instance = %name, "resuming deferred stop");
            if self.stop_or_defer(&name).await && transitioning {
                self.mark_stopped(&name).await;
            }
        }
    }

    // ── Health ────────────────────────────────────────────────────

    fn apply_report(&mut self, report: &HealthReport) {
        let Some(inst) = self.state.instance(&report.name) else {
            return;
        };
        // Stopped containers are not probed; late reports are stale.
        if matches!(inst.role, InstanceRole::Standby | InstanceRole::Quarantined) {
            return;
        }
        let role = inst.role;
        let previous = self.state.record_health(
            &report.name,
            report.status,
            report.consecutive_failures,
            report.checked_at,
        );
        if previous != Some(report.status) && role == InstanceRole::Active {
            match report.status {
                HealthStatus::Unhealthy => warn!(instance = %report.name, "active instance became unhealthy"),
                HealthStatus::Healthy => info!(instance = %report.name, "active instance healthy"),
                HealthStatus::Unknown => {}
            }
        }
    }

    /// Apply a batch of monitor reports.
    pub fn apply_health(&mut self, batch: Vec<HealthReport>) {
        for report in &batch {
            self.apply_report(report);
        }
        self.record_availability();
        self.state.check_invariant("health update");
        self.publish();
    }

    fn drain_health_reports(&mut self) {
        let mut batches = Vec::new();
        if let Some(rx) = self.health_rx.as_mut() {
            while let Ok(batch) = rx.try_recv() {
                batches.push(batch);
            }
        }
        for report in batches.iter().flatten() {
            self.apply_report(report);
        }
    }

    /// Unhealthy Standby instances go back to Unknown once
    /// `standby_cooldown` has passed since their last check, which makes them
    /// candidates again.
    fn expire_standby_health(&mut self, now: u64) {
        for name in selection::cooled_down(&self.state, now, self.settings.standby_cooldown) {
            if let Some(inst) = self.state.instance_mut(&name) {
                inst.set_health(HealthStatus::Unknown, now);
                inst.consecutive_failures = 0;
            }
            info!(instance = %name, "standby cooldown elapsed, health reset to unknown");
        }
    }

    fn record_availability(&self) {
        self.telemetry.record_availability(AvailabilitySample {
            at: epoch_millis(),
            serving: self.state.serving_count(),
            min_healthy: self.state.min_healthy,
        });
    }

    // ── Runtime pause ─────────────────────────────────────────────

    async fn ping(&self) -> LifecycleResult<()> {
        match timeout(PING_TIMEOUT, self.lifecycle.ping()).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Unavailable(format!(
                "ping exceeded {PING_TIMEOUT:?}"
            ))),
        }
    }

    fn enter_pause(&mut self, err: &LifecycleError) {
        if self.pause.is_some() {
            return;
        }
        error!(error = %err, "container runtime unavailable, pausing rotation");
        self.pause = Some(Pause {
            backoff: RUNTIME_BACKOFF_BASE,
            next_ping: Instant::now() + RUNTIME_BACKOFF_BASE,
        });
        self.publish();
    }

    async fn retry_runtime(&mut self) {
        match self.ping().await {
            Ok(()) => {
                info!("container runtime reachable again, resuming rotation");
                self.pause = None;
                self.resume_deferred_stops().await;
            }
            Err(e) => {
                let max = self.settings.runtime_backoff_max;
                if let Some(pause) = self.pause.as_mut() {
                    pause.backoff = (pause.backoff * 2).min(max);
                    pause.next_ping = Instant::now() + pause.backoff;
                    debug!(error = %e, backoff = ?pause.backoff, "runtime still unavailable");
                }
            }
        }
        self.publish();
    }

    /// Re-ping the runtime now, clearing the pause on success.
    pub async fn probe_runtime(&mut self) -> bool {
        if self.pause.is_some() {
            self.retry_runtime().await;
        }
        self.pause.is_none()
    }

    // ── Operator actions ──────────────────────────────────────────

    /// Return a Quarantined instance to Standby with fresh counters.
    pub async fn clear_quarantine(&mut self, name: &str) -> RotationResult<()> {
        let now = epoch_millis();
        let inst = self
            .state
            .instance_mut(name)
            .ok_or_else(|| RotationError::UnknownInstance(name.to_string()))?;
        if inst.role != InstanceRole::Quarantined {
            return Err(RotationError::NotQuarantined(name.to_string()));
        }
        inst.rotation_failures = 0;
        inst.consecutive_failures = 0;
        inst.set_health(HealthStatus::Unknown, now);
        inst.set_role(InstanceRole::Standby, now);
        let _ = self.health.reset(name).await;

        info!(instance = name, "quarantine cleared");
        self.publish();
        Ok(())
    }

    fn alert(&mut self, plan_id: Option<PlanId>, reason: Option<FailureReason>, message: String) {
        error!(alert = true, plan = ?plan_id, reason = ?reason, %message, "operator alert");
        self.alerts.push_back(Alert {
            at: epoch_millis(),
            plan_id,
            reason,
            message,
        });
        while self.alerts.len() > MAX_ALERTS {
            self.alerts.pop_front();
        }
    }

    // ── Status ────────────────────────────────────────────────────

    fn view(&self) -> StatusView {
        StatusView {
            instances: self.state.instances().cloned().collect(),
            current_plan: self.state.current_plan.clone(),
            last_plan: self.last_plan.clone(),
            min_healthy: self.state.min_healthy,
            active_target: self.state.active_target,
            serving: self.state.serving_count(),
            interval_min_ms: self.state.interval.0.as_millis() as u64,
            interval_max_ms: self.state.interval.1.as_millis() as u64,
            runtime_paused: self.pause.is_some(),
            alerts: self.alerts.iter().cloned().collect(),
            updated_at: epoch_millis(),
        }
    }

    /// Latest status as published to handles.
    pub fn status_view(&self) -> StatusView {
        self.view()
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.view());
    }
}

pub(crate) fn empty_view() -> StatusView {
    StatusView {
        instances: Vec::new(),
        current_plan: None,
        last_plan: None,
        min_healthy: 0,
        active_target: 0,
        serving: 0,
        interval_min_ms: 0,
        interval_max_ms: 0,
        runtime_paused: false,
        alerts: Vec::new(),
        updated_at: 0,
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
