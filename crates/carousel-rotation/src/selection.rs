//! Candidate and retiring-instance selection.
//!
//! Both choices are uniform over the eligible set and draw from the
//! injected random source, so a seeded generator makes them reproducible.

use std::time::Duration;

use carousel_core::{HealthStatus, Instance, InstanceName, InstanceRole};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::state::RotationState;

/// Names eligible to become the next candidate, in name order: Standby and
/// not Unhealthy.
pub fn eligible_candidates(state: &RotationState) -> Vec<InstanceName> {
    state
        .instances()
        .filter(|i| i.is_eligible_candidate())
        .map(|i| i.name.clone())
        .collect()
}

/// Pick the next candidate uniformly among eligible Standby instances.
pub fn choose_candidate<R: Rng + ?Sized>(state: &RotationState, rng: &mut R) -> Option<InstanceName> {
    eligible_candidates(state).choose(rng).cloned()
}

/// Unhealthy Standby instances whose last check is at least `cooldown` old.
pub fn cooled_down(state: &RotationState, now: u64, cooldown: Duration) -> Vec<InstanceName> {
    let cooldown = cooldown.as_millis() as u64;
    state
        .instances()
        .filter(|i| i.role == InstanceRole::Standby && i.health == HealthStatus::Unhealthy)
        .filter(|i| {
            let since = i.last_checked_at.unwrap_or(i.last_state_change_at);
            now.saturating_sub(since) >= cooldown
        })
        .map(|i| i.name.clone())
        .collect()
}

/// Pick the Active instance to retire: an Unhealthy one if any, otherwise
/// uniformly among all Active instances.
pub fn choose_retiring<R: Rng + ?Sized>(state: &RotationState, rng: &mut R) -> Option<InstanceName> {
    let actives: Vec<&Instance> = state
        .instances()
        .filter(|i| i.role == InstanceRole::Active)
        .collect();
    let unhealthy: Vec<&Instance> = actives
        .iter()
        .copied()
        .filter(|i| i.health == HealthStatus::Unhealthy)
        .collect();

    let pool = if unhealthy.is_empty() { actives } else { unhealthy };
    pool.choose(rng).map(|i| i.name.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(600);

    fn state() -> RotationState {
        RotationState::new(
            ["web1", "web2", "web3", "web4"].map(|n| (n.to_string(), format!("{n}:8080"))),
            1,
            1,
            (Duration::from_secs(60), Duration::from_secs(120)),
            0,
        )
    }

    #[test]
    fn only_standby_instances_are_candidates() {
        let mut state = state();
        state.set_role("web1", InstanceRole::Active, 0);
        state.set_role("web2", InstanceRole::Quarantined, 0);
        state.set_role("web3", InstanceRole::Transitioning, 0);
        assert_eq!(eligible_candidates(&state), vec!["web4"]);
    }

    #[test]
    fn unhealthy_standby_is_never_a_candidate() {
        let mut state = state();
        for name in ["web1", "web2", "web3"] {
            state.set_role(name, InstanceRole::Active, 0);
        }
        state.record_health("web4", HealthStatus::Unhealthy, 3, 1_000);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(choose_candidate(&state, &mut rng), None);
        assert_eq!(choose_candidate(&state, &mut rng), None);
    }

    #[test]
    fn cooldown_counts_from_the_last_check() {
        let mut state = state();
        state.set_role("web1", InstanceRole::Active, 0);
        state.record_health("web1", HealthStatus::Unhealthy, 3, 0);
        state.record_health("web3", HealthStatus::Unhealthy, 3, 1_000);
        state.record_health("web4", HealthStatus::Unhealthy, 3, 500_000);

        assert!(cooled_down(&state, 2_000, COOLDOWN).is_empty());
        // Active instances are the monitor's business, never cooled down here.
        assert_eq!(cooled_down(&state, 601_000, COOLDOWN), vec!["web3"]);
        assert_eq!(cooled_down(&state, 1_100_000, COOLDOWN), vec!["web3", "web4"]);
    }

    #[test]
    fn seeded_choice_is_reproducible() {
        let state = state();
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8)
                .map(|_| choose_candidate(&state, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(pick(42), pick(42));
    }

    #[test]
    fn candidate_choice_covers_all_eligible() {
        let state = state();
        let mut rng = StdRng::seed_from_u64(1);
        let seen: BTreeSet<_> = (0..200)
            .map(|_| choose_candidate(&state, &mut rng).unwrap())
            .collect();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn unhealthy_active_is_retired_first() {
        let mut state = state();
        for name in ["web1", "web2", "web3"] {
            state.set_role(name, InstanceRole::Active, 0);
            state.record_health(name, HealthStatus::Healthy, 0, 0);
        }
        state.record_health("web2", HealthStatus::Unhealthy, 3, 1);

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(choose_retiring(&state, &mut rng), Some("web2".to_string()));
        }
    }

    #[test]
    fn no_actives_means_nothing_to_retire() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(choose_retiring(&state(), &mut rng), None);
    }
}
