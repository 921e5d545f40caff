//! Bounded rotation history and snapshot computation.

use std::collections::VecDeque;
use std::time::Duration;

use carousel_core::{AvailabilitySample, PlanOutcome, RotationPlan, TelemetrySnapshot};

/// Change points kept beyond which the oldest are dropped.
const MAX_SAMPLES: usize = 4096;

/// Finished plans and availability change points within retention.
#[derive(Debug, Clone)]
pub struct RotationHistory {
    plans: VecDeque<RotationPlan>,
    samples: VecDeque<AvailabilitySample>,
    retention_count: usize,
    retention_window_ms: u64,
}

impl RotationHistory {
    pub fn new(retention_count: usize, retention_window: Duration) -> Self {
        Self {
            plans: VecDeque::new(),
            samples: VecDeque::new(),
            retention_count: retention_count.max(1),
            retention_window_ms: retention_window.as_millis() as u64,
        }
    }

    fn window_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.retention_window_ms)
    }

    /// Append a finished plan. Unfinished plans are ignored.
    pub fn push(&mut self, plan: RotationPlan, now: u64) {
        if !plan.is_finished() {
            return;
        }
        self.plans.push_back(plan);
        self.evict(now);
    }

    /// Record an availability observation. Only changes are kept.
    pub fn push_sample(&mut self, sample: AvailabilitySample, now: u64) {
        let unchanged = self
            .samples
            .back()
            .is_some_and(|last| last.serving == sample.serving && last.min_healthy == sample.min_healthy);
        if !unchanged {
            self.samples.push_back(sample);
        }
        self.evict(now);
    }

    /// Drop plans outside the window or beyond the count, and samples
    /// that no longer affect the window.
    pub fn evict(&mut self, now: u64) {
        let start = self.window_start(now);
        self.plans
            .retain(|p| p.finished_at.unwrap_or(p.started_at) >= start);
        while self.plans.len() > self.retention_count {
            self.plans.pop_front();
        }

        // Keep the last sample before the window as the state at its start.
        while self.samples.len() >= 2 && self.samples[1].at <= start {
            self.samples.pop_front();
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Most recent plans first.
    pub fn recent(&self, limit: usize) -> Vec<RotationPlan> {
        self.plans.iter().rev().take(limit).cloned().collect()
    }

    pub fn last_plan_id(&self) -> Option<u64> {
        self.plans.iter().map(|p| p.id).max()
    }

    /// Scan the retained history once.
    pub fn snapshot(&self, now: u64) -> TelemetrySnapshot {
        let window_start = self.window_start(now);
        let mut total = 0u64;
        let mut failed = 0u64;
        let mut rolled_back = 0u64;
        let mut duration_sum = 0u64;

        for plan in self
            .plans
            .iter()
            .filter(|p| p.finished_at.unwrap_or(p.started_at) >= window_start)
        {
            total += 1;
            match plan.outcome {
                Some(PlanOutcome::Success) => {}
                Some(PlanOutcome::RolledBack) => {
                    failed += 1;
                    rolled_back += 1;
                }
                _ => failed += 1,
            }
            duration_sum += plan.duration_ms().unwrap_or(0);
        }

        TelemetrySnapshot {
            window_start,
            uptime_percent: self.uptime_percent(window_start, now),
            total_rotations: total,
            failed_rotations: failed,
            rolled_back_rotations: rolled_back,
            mean_duration_ms: if total == 0 {
                0.0
            } else {
                duration_sum as f64 / total as f64
            },
            cached_at: now,
        }
    }

    /// Time-weighted share of the observed window with the floor met.
    ///
    /// Each sample holds until the next one. Time before the first
    /// sample is not counted. With nothing observed, reports 100.
    fn uptime_percent(&self, window_start: u64, now: u64) -> f64 {
        let mut observed = 0u64;
        let mut available = 0u64;

        for (i, sample) in self.samples.iter().enumerate() {
            let start = sample.at.max(window_start);
            let end = self.samples.get(i + 1).map_or(now, |next| next.at).min(now);
            if end <= start {
                continue;
            }
            observed += end - start;
            if sample.is_available() {
                available += end - start;
            }
        }

        if observed == 0 {
            return match self.samples.back() {
                Some(last) if !last.is_available() => 0.0,
                _ => 100.0,
            };
        }
        available as f64 * 100.0 / observed as f64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use carousel_core::{FailureReason, Trigger};

    use super::*;

    fn finished(id: u64, started: u64, finished: u64, outcome: PlanOutcome) -> RotationPlan {
        let mut plan = RotationPlan::begin(id, Trigger::Scheduled, BTreeSet::new(), started);
        let reason = (outcome != PlanOutcome::Success).then_some(FailureReason::HealthCheckTimeout);
        plan.finish(outcome, reason, None, finished);
        plan
    }

    fn sample(at: u64, serving: u32) -> AvailabilitySample {
        AvailabilitySample {
            at,
            serving,
            min_healthy: 1,
        }
    }

    #[test]
    fn counts_and_mean_duration() {
        let mut history = RotationHistory::new(100, Duration::from_secs(3600));
        history.push(finished(1, 1_000, 1_400, PlanOutcome::Success), 2_000);
        history.push(finished(2, 2_000, 2_200, PlanOutcome::RolledBack), 3_000);
        history.push(finished(3, 3_000, 3_000, PlanOutcome::Failed), 4_000);

        let snap = history.snapshot(5_000);
        assert_eq!(snap.total_rotations, 3);
        assert_eq!(snap.failed_rotations, 2);
        assert_eq!(snap.rolled_back_rotations, 1);
        assert!((snap.mean_duration_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unfinished_plans_are_ignored() {
        let mut history = RotationHistory::new(10, Duration::from_secs(60));
        history.push(RotationPlan::begin(1, Trigger::Manual, BTreeSet::new(), 0), 0);
        assert!(history.is_empty());
    }

    #[test]
    fn retention_count_evicts_oldest() {
        let mut history = RotationHistory::new(2, Duration::from_secs(3600));
        for id in 1..=3 {
            history.push(finished(id, id * 10, id * 10 + 1, PlanOutcome::Success), 100);
        }
        let ids: Vec<_> = history.recent(10).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn retention_window_evicts_old_plans() {
        let mut history = RotationHistory::new(100, Duration::from_millis(1_000));
        history.push(finished(1, 0, 100, PlanOutcome::Success), 100);
        history.push(finished(2, 1_500, 1_600, PlanOutcome::Failed), 1_600);
        assert_eq!(history.len(), 1);
        assert_eq!(history.snapshot(1_600).total_rotations, 1);
    }

    #[test]
    fn uptime_is_time_weighted() {
        let mut history = RotationHistory::new(10, Duration::from_millis(1_000));
        history.push_sample(sample(0, 1), 0);
        history.push_sample(sample(600, 0), 600);
        history.push_sample(sample(900, 2), 900);

        // Window [0, 1000): available for 600 + 100, unavailable for 300.
        let snap = history.snapshot(1_000);
        assert!((snap.uptime_percent - 70.0).abs() < 1e-9);
    }

    #[test]
    fn uptime_uses_anchor_before_window() {
        let mut history = RotationHistory::new(10, Duration::from_millis(1_000));
        history.push_sample(sample(0, 0), 0);
        history.push_sample(sample(5_500, 1), 5_500);

        // Window [5000, 6000): unavailable until 5500.
        let snap = history.snapshot(6_000);
        assert!((snap.uptime_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn uptime_without_samples_is_full() {
        let history = RotationHistory::new(10, Duration::from_secs(60));
        assert!((history.snapshot(1_000).uptime_percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_samples_are_coalesced() {
        let mut history = RotationHistory::new(10, Duration::from_secs(60));
        for at in 0..10 {
            history.push_sample(sample(at, 2), at);
        }
        assert_eq!(history.samples.len(), 1);
    }
}
