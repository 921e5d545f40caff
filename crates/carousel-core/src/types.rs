//! Domain types shared by the orchestrator components.
//!
//! Timestamps are unix epoch milliseconds. All types serialize to JSON for
//! the admin API and the telemetry store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Stable logical name of a managed replica (e.g. `web2`).
pub type InstanceName = String;

/// Identifier of a rotation plan, monotonically increasing per process.
pub type PlanId = u64;

// ── Instance ──────────────────────────────────────────────────────

/// Rotation role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    /// Eligible to receive traffic per the proxy's backend set.
    Active,
    /// Not receiving traffic, runnable as a rotation candidate.
    Standby,
    /// Being started or stopped by an in-flight rotation.
    Transitioning,
    /// Excluded from candidacy until an operator clears it.
    Quarantined,
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One managed container replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// Runtime-assigned container id, filled in once inspected.
    pub id: Option<String>,
    pub name: InstanceName,
    /// `host:port` the health probe connects to.
    pub address: String,
    pub role: InstanceRole,
    pub health: HealthStatus,
    /// Consecutive failed probes, reset on success.
    pub consecutive_failures: u32,
    /// Start or health-verification failures while a rotation candidate.
    pub rotation_failures: u32,
    pub last_checked_at: Option<u64>,
    pub last_state_change_at: u64,
}

impl Instance {
    /// A freshly enumerated replica: Standby, health unknown.
    pub fn new(name: &str, address: &str, now: u64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            address: address.to_string(),
            role: InstanceRole::Standby,
            health: HealthStatus::Unknown,
            consecutive_failures: 0,
            rotation_failures: 0,
            last_checked_at: None,
            last_state_change_at: now,
        }
    }

    /// Active and Healthy: counts toward the minimum-healthy floor.
    pub fn is_serving(&self) -> bool {
        self.role == InstanceRole::Active && self.health == HealthStatus::Healthy
    }

    /// Whether this instance may be picked as the next rotation candidate.
    pub fn is_eligible_candidate(&self) -> bool {
        self.role == InstanceRole::Standby && self.health != HealthStatus::Unhealthy
    }

    /// Change role, stamping `last_state_change_at` only on a real change.
    pub fn set_role(&mut self, role: InstanceRole, now: u64) {
        if self.role != role {
            self.role = role;
            self.last_state_change_at = now;
        }
    }

    /// Change health, stamping `last_state_change_at` only on a real change.
    pub fn set_health(&mut self, health: HealthStatus, now: u64) {
        if self.health != health {
            self.health = health;
            self.last_state_change_at = now;
        }
    }
}

// ── Rotation plan ─────────────────────────────────────────────────

/// What started a rotation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Final result of a rotation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    /// `to_active` is serving traffic.
    Success,
    /// The cycle was undone; `from_active` is serving traffic.
    RolledBack,
    /// The cycle never mutated anything.
    Failed,
}

/// Why a cycle did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoEligibleCandidate,
    StartFailure,
    ContainerStartTimeout,
    HealthCheckTimeout,
    ProxyReloadFailure,
    RuntimeApiUnavailable,
}

impl FailureReason {
    /// High-severity reasons are surfaced as operator alerts.
    pub fn is_alert(self) -> bool {
        matches!(self, Self::ProxyReloadFailure)
    }

    /// Whether this failure counts toward quarantining the candidate.
    pub fn counts_against_candidate(self) -> bool {
        matches!(
            self,
            Self::StartFailure | Self::ContainerStartTimeout | Self::HealthCheckTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoEligibleCandidate => "no_eligible_candidate",
            Self::StartFailure => "start_failure",
            Self::ContainerStartTimeout => "container_start_timeout",
            Self::HealthCheckTimeout => "health_check_timeout",
            Self::ProxyReloadFailure => "proxy_reload_failure",
            Self::RuntimeApiUnavailable => "runtime_api_unavailable",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    Idle,
    SelectingCandidate,
    StartingCandidate,
    VerifyingCandidate,
    CuttingOverProxy,
    StoppingPrevious,
    RollingBack,
}

/// Description of one rotation attempt.
///
/// `from_active` and `to_active` may overlap only while the plan is in
/// flight. Once finished, `to_active` is serving on `Success` and
/// `from_active` on `RolledBack` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationPlan {
    pub id: PlanId,
    pub trigger: Trigger,
    pub phase: RotationPhase,
    pub from_active: BTreeSet<InstanceName>,
    pub to_active: BTreeSet<InstanceName>,
    pub candidate: Option<InstanceName>,
    pub retiring: Option<InstanceName>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub outcome: Option<PlanOutcome>,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
}

impl RotationPlan {
    /// Open a plan at `SelectingCandidate`; `to_active` starts equal to
    /// `from_active`.
    pub fn begin(
        id: PlanId,
        trigger: Trigger,
        from_active: BTreeSet<InstanceName>,
        now: u64,
    ) -> Self {
        Self {
            id,
            trigger,
            phase: RotationPhase::SelectingCandidate,
            to_active: from_active.clone(),
            from_active,
            candidate: None,
            retiring: None,
            started_at: now,
            finished_at: None,
            outcome: None,
            reason: None,
            detail: None,
        }
    }

    /// Close the plan. Phase returns to `Idle`.
    pub fn finish(
        &mut self,
        outcome: PlanOutcome,
        reason: Option<FailureReason>,
        detail: Option<String>,
        now: u64,
    ) {
        if outcome != PlanOutcome::Success {
            self.to_active = self.from_active.clone();
        }
        self.phase = RotationPhase::Idle;
        self.outcome = Some(outcome);
        self.reason = reason;
        self.detail = detail;
        self.finished_at = Some(now.max(self.started_at));
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Some(PlanOutcome::Success)
    }

    /// Wall-clock duration in milliseconds, `None` while in flight.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| end.saturating_sub(self.started_at))
    }
}

// ── Telemetry ─────────────────────────────────────────────────────

/// Derived rotation metrics over the retention window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub window_start: u64,
    /// Time-weighted share of the window with `serving >= min_healthy`.
    pub uptime_percent: f64,
    pub total_rotations: u64,
    /// Plans whose outcome is not `Success`.
    pub failed_rotations: u64,
    pub rolled_back_rotations: u64,
    pub mean_duration_ms: f64,
    pub cached_at: u64,
}

/// One observation of the serving floor, recorded after health updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilitySample {
    pub at: u64,
    pub serving: u32,
    pub min_healthy: u32,
}

impl AvailabilitySample {
    pub fn is_available(&self) -> bool {
        self.serving >= self.min_healthy
    }
}

// ── Status view ───────────────────────────────────────────────────

/// Operator-visible alert for high-severity failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub at: u64,
    pub plan_id: Option<PlanId>,
    pub reason: Option<FailureReason>,
    pub message: String,
}

/// Read-only summary of the rotation state published by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusView {
    pub instances: Vec<Instance>,
    pub current_plan: Option<RotationPlan>,
    pub last_plan: Option<RotationPlan>,
    pub min_healthy: u32,
    pub active_target: u32,
    pub serving: u32,
    pub interval_min_ms: u64,
    pub interval_max_ms: u64,
    pub runtime_paused: bool,
    pub alerts: Vec<Alert>,
    pub updated_at: u64,
}

impl StatusView {
    /// Names of instances currently in the given role.
    pub fn names_in_role(&self, role: InstanceRole) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|i| i.role == role)
            .map(|i| i.name.as_str())
            .collect()
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn instance_starts_standby_unknown() {
        let inst = Instance::new("web1", "web1:8080", 1000);
        assert_eq!(inst.role, InstanceRole::Standby);
        assert_eq!(inst.health, HealthStatus::Unknown);
        assert!(inst.is_eligible_candidate());
        assert!(!inst.is_serving());
    }

    #[test]
    fn unhealthy_standby_is_not_eligible() {
        let mut inst = Instance::new("web1", "web1:8080", 1000);
        inst.set_health(HealthStatus::Unhealthy, 2000);
        assert!(!inst.is_eligible_candidate());
        assert_eq!(inst.last_state_change_at, 2000);
    }

    #[test]
    fn set_role_only_stamps_real_changes() {
        let mut inst = Instance::new("web1", "web1:8080", 1000);
        inst.set_role(InstanceRole::Standby, 5000);
        assert_eq!(inst.last_state_change_at, 1000);
        inst.set_role(InstanceRole::Active, 6000);
        assert_eq!(inst.last_state_change_at, 6000);
    }

    #[test]
    fn failed_plan_reverts_to_active_set() {
        let mut plan = RotationPlan::begin(1, Trigger::Manual, names(&["web1"]), 100);
        plan.to_active = names(&["web2"]);
        plan.finish(PlanOutcome::RolledBack, Some(FailureReason::HealthCheckTimeout), None, 400);

        assert_eq!(plan.to_active, names(&["web1"]));
        assert_eq!(plan.phase, RotationPhase::Idle);
        assert_eq!(plan.duration_ms(), Some(300));
        assert!(!plan.is_success());
    }

    #[test]
    fn successful_plan_keeps_target_set() {
        let mut plan = RotationPlan::begin(2, Trigger::Scheduled, names(&["web1"]), 100);
        plan.to_active = names(&["web2"]);
        plan.finish(PlanOutcome::Success, None, None, 150);
        assert_eq!(plan.to_active, names(&["web2"]));
        assert!(plan.is_finished());
    }

    #[test]
    fn enums_serialize_snake_case() {
        let json = serde_json::to_string(&FailureReason::NoEligibleCandidate).unwrap();
        assert_eq!(json, "\"no_eligible_candidate\"");
        let json = serde_json::to_string(&RotationPhase::CuttingOverProxy).unwrap();
        assert_eq!(json, "\"cutting_over_proxy\"");
    }
}
