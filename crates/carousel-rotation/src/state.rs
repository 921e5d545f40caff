//! RotationState: the controller's exclusively owned view of the fleet.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use carousel_core::{HealthStatus, Instance, InstanceName, InstanceRole, RotationPlan};
use tracing::{debug, warn};

/// Instances, the in-flight plan and the configured floor.
#[derive(Debug, Clone)]
pub struct RotationState {
    instances: BTreeMap<InstanceName, Instance>,
    pub current_plan: Option<RotationPlan>,
    pub min_healthy: u32,
    pub active_target: u32,
    pub interval: (Duration, Duration),
}

impl RotationState {
    /// Every configured replica starts Standby with unknown health.
    pub fn new<I>(
        instances: I,
        min_healthy: u32,
        active_target: u32,
        interval: (Duration, Duration),
        now: u64,
    ) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let instances = instances
            .into_iter()
            .map(|(name, address)| {
                let inst = Instance::new(&name, &address, now);
                (name, inst)
            })
            .collect();
        Self {
            instances,
            current_plan: None,
            min_healthy,
            active_target,
            interval,
        }
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.instances.get_mut(name)
    }

    /// Instances in name order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn names(&self) -> Vec<InstanceName> {
        self.instances.keys().cloned().collect()
    }

    /// Active ∧ Healthy.
    pub fn serving_count(&self) -> u32 {
        self.instances().filter(|i| i.is_serving()).count() as u32
    }

    pub fn count_role(&self, role: InstanceRole) -> u32 {
        self.instances().filter(|i| i.role == role).count() as u32
    }

    pub fn names_in_role(&self, role: InstanceRole) -> BTreeSet<InstanceName> {
        self.instances()
            .filter(|i| i.role == role)
            .map(|i| i.name.clone())
            .collect()
    }

    pub fn active_set(&self) -> BTreeSet<InstanceName> {
        self.names_in_role(InstanceRole::Active)
    }

    /// Healthy Active instances as `(name, address)`.
    pub fn healthy_actives(&self) -> Vec<(InstanceName, String)> {
        self.instances()
            .filter(|i| i.is_serving())
            .map(|i| (i.name.clone(), i.address.clone()))
            .collect()
    }

    /// Whether the serving floor currently holds.
    pub fn floor_holds(&self) -> bool {
        self.serving_count() >= self.min_healthy
    }

    /// Log a breach of the serving floor. Returns whether it holds.
    pub fn check_invariant(&self, context: &str) -> bool {
        let serving = self.serving_count();
        if serving < self.min_healthy {
            warn!(serving, min_healthy = self.min_healthy, context, "serving floor breached");
            return false;
        }
        true
    }

    /// Whether taking `name` out of service keeps the floor.
    pub fn can_retire(&self, name: &str) -> bool {
        let serving = self.serving_count();
        let lost = self.instance(name).is_some_and(|i| i.is_serving()) as u32;
        serving.saturating_sub(lost) >= self.min_healthy
    }

    /// Change an instance's role. Returns `false` for unknown names.
    pub fn set_role(&mut self, name: &str, role: InstanceRole, now: u64) -> bool {
        match self.instances.get_mut(name) {
            Some(inst) => {
                if inst.role != role {
                    debug!(instance = name, from = ?inst.role, to = ?role, "role change");
                }
                inst.set_role(role, now);
                true
            }
            None => false,
        }
    }

    /// Apply a health observation. Returns the previous health.
    pub fn record_health(
        &mut self,
        name: &str,
        health: HealthStatus,
        consecutive_failures: u32,
        checked_at: u64,
    ) -> Option<HealthStatus> {
        let inst = self.instances.get_mut(name)?;
        let previous = inst.health;
        inst.set_health(health, checked_at);
        inst.consecutive_failures = consecutive_failures;
        inst.last_checked_at = Some(checked_at);
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(min_healthy: u32) -> RotationState {
        RotationState::new(
            ["web1", "web2", "web3"].map(|n| (n.to_string(), format!("{n}:8080"))),
            min_healthy,
            1,
            (Duration::from_secs(60), Duration::from_secs(120)),
            0,
        )
    }

    fn make_serving(state: &mut RotationState, name: &str) {
        state.set_role(name, InstanceRole::Active, 1);
        state.record_health(name, HealthStatus::Healthy, 0, 1);
    }

    #[test]
    fn starts_all_standby() {
        let state = state(1);
        assert_eq!(state.count_role(InstanceRole::Standby), 3);
        assert_eq!(state.serving_count(), 0);
        assert!(!state.floor_holds());
    }

    #[test]
    fn serving_requires_active_and_healthy() {
        let mut state = state(1);
        state.set_role("web1", InstanceRole::Active, 1);
        assert_eq!(state.serving_count(), 0);
        state.record_health("web1", HealthStatus::Healthy, 0, 2);
        assert_eq!(state.serving_count(), 1);
        assert!(state.check_invariant("test"));
    }

    #[test]
    fn cannot_retire_last_serving_instance() {
        let mut state = state(1);
        make_serving(&mut state, "web1");
        assert!(!state.can_retire("web1"));

        make_serving(&mut state, "web2");
        assert!(state.can_retire("web1"));
    }

    #[test]
    fn retiring_unhealthy_active_is_free() {
        let mut state = state(1);
        make_serving(&mut state, "web1");
        state.set_role("web2", InstanceRole::Active, 1);
        state.record_health("web2", HealthStatus::Unhealthy, 3, 1);
        assert!(state.can_retire("web2"));
        assert_eq!(state.healthy_actives(), vec![("web1".to_string(), "web1:8080".to_string())]);
    }

    #[test]
    fn record_health_stamps_check_time() {
        let mut state = state(1);
        let previous = state.record_health("web2", HealthStatus::Unhealthy, 3, 500);
        assert_eq!(previous, Some(HealthStatus::Unknown));
        let inst = state.instance("web2").unwrap();
        assert_eq!(inst.last_checked_at, Some(500));
        assert_eq!(inst.consecutive_failures, 3);
        assert_eq!(state.record_health("nope", HealthStatus::Healthy, 0, 1), None);
    }
}
