//! The telemetry handle shared by the controller and the admin API.
//!
//! `record` only touches an in-memory buffer and a bounded channel, so it
//! can never block or fail a rotation. The persist worker drains the
//! channel into redb.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use carousel_core::config::TelemetryConfig;
use carousel_core::{AvailabilitySample, PlanId, RotationPlan, TelemetrySnapshot, epoch_millis};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TelemetryResult;
use crate::history::RotationHistory;
use crate::store::TelemetryStore;

const PERSIST_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySettings {
    pub retention_count: usize,
    pub retention_window: Duration,
    pub cache_ttl: Duration,
}

impl TelemetrySettings {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            retention_count: config.retention_count,
            retention_window: config.retention_window,
            cache_ttl: config.cache_ttl,
        }
    }
}

struct Shared {
    history: Mutex<RotationHistory>,
    cache: Mutex<Option<(Instant, TelemetrySnapshot)>>,
    ttl: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cheap, cloneable recorder and reader of rotation telemetry.
#[derive(Clone)]
pub struct Telemetry {
    shared: Arc<Shared>,
    persist: Option<mpsc::Sender<RotationPlan>>,
}

impl Telemetry {
    /// History kept in memory only.
    pub fn in_memory(settings: TelemetrySettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                history: Mutex::new(RotationHistory::new(
                    settings.retention_count,
                    settings.retention_window,
                )),
                cache: Mutex::new(None),
                ttl: settings.cache_ttl,
            }),
            persist: None,
        }
    }

    /// Reload retained history from `store` and return the worker that
    /// persists newly recorded plans. Spawn `PersistWorker::run`.
    pub fn with_store(
        settings: TelemetrySettings,
        store: TelemetryStore,
    ) -> TelemetryResult<(Self, PersistWorker)> {
        let mut telemetry = Self::in_memory(settings);
        let now = epoch_millis();
        let plans = store.list_plans()?;
        let loaded = plans.len();
        {
            let mut history = lock(&telemetry.shared.history);
            for plan in plans {
                history.push(plan, now);
            }
        }
        info!(loaded, "rotation history reloaded");

        let (tx, rx) = mpsc::channel(PERSIST_QUEUE);
        telemetry.persist = Some(tx);
        let worker = PersistWorker {
            store,
            rx,
            settings,
        };
        Ok((telemetry, worker))
    }

    /// Append a finished plan. Never blocks, never fails.
    pub fn record(&self, plan: RotationPlan) {
        if !plan.is_finished() {
            debug!(plan = plan.id, "ignoring unfinished plan");
            return;
        }
        if let Some(tx) = &self.persist {
            if let Err(e) = tx.try_send(plan.clone()) {
                warn!(plan = plan.id, error = %e, "telemetry persistence queue unavailable, plan kept in memory only");
            }
        }
        lock(&self.shared.history).push(plan, epoch_millis());
    }

    /// Record the serving count observed after a health update.
    pub fn record_availability(&self, sample: AvailabilitySample) {
        lock(&self.shared.history).push_sample(sample, epoch_millis());
    }

    /// Cached snapshot, recomputed once the TTL has expired.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut cache = lock(&self.shared.cache);
        if let Some((computed, snapshot)) = cache.as_ref() {
            if computed.elapsed() < self.shared.ttl {
                return snapshot.clone();
            }
        }

        let snapshot = {
            let mut history = lock(&self.shared.history);
            let now = epoch_millis();
            history.evict(now);
            history.snapshot(now)
        };
        *cache = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Most recent finished plans, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RotationPlan> {
        lock(&self.shared.history).recent(limit)
    }

    /// Highest plan id still retained.
    pub fn last_plan_id(&self) -> Option<PlanId> {
        lock(&self.shared.history).last_plan_id()
    }
}

/// Drains recorded plans into the redb store.
pub struct PersistWorker {
    store: TelemetryStore,
    rx: mpsc::Receiver<RotationPlan>,
    settings: TelemetrySettings,
}

impl PersistWorker {
    /// Runs until every `Telemetry` handle has been dropped.
    pub async fn run(mut self) {
        while let Some(plan) = self.rx.recv().await {
            if let Err(e) = self.store.put_plan(&plan) {
                warn!(plan = plan.id, error = %e, "failed to persist rotation plan");
                continue;
            }
            let min_finished_at = epoch_millis()
                .saturating_sub(self.settings.retention_window.as_millis() as u64);
            if let Err(e) = self.store.prune(min_finished_at, self.settings.retention_count) {
                warn!(error = %e, "failed to prune telemetry store");
            }
        }
        debug!("telemetry persist worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use carousel_core::{FailureReason, PlanOutcome, Trigger};

    use super::*;

    fn settings(ttl: Duration) -> TelemetrySettings {
        TelemetrySettings {
            retention_count: 100,
            retention_window: Duration::from_secs(3600),
            cache_ttl: ttl,
        }
    }

    fn plan(id: PlanId, outcome: PlanOutcome) -> RotationPlan {
        let now = epoch_millis();
        let mut plan = RotationPlan::begin(id, Trigger::Scheduled, BTreeSet::new(), now);
        let reason = (outcome != PlanOutcome::Success).then_some(FailureReason::NoEligibleCandidate);
        plan.finish(outcome, reason, None, now);
        plan
    }

    #[tokio::test]
    async fn snapshot_counts_recorded_plans() {
        let telemetry = Telemetry::in_memory(settings(Duration::ZERO));
        telemetry.record(plan(1, PlanOutcome::Success));
        telemetry.record(plan(2, PlanOutcome::Failed));
        telemetry.record(plan(3, PlanOutcome::RolledBack));

        let snap = telemetry.snapshot();
        assert_eq!(snap.total_rotations, 3);
        assert_eq!(snap.failed_rotations, 2);
        assert_eq!(snap.rolled_back_rotations, 1);
        assert_eq!(telemetry.recent(1)[0].id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_cached_until_ttl() {
        let telemetry = Telemetry::in_memory(settings(Duration::from_secs(10)));
        assert_eq!(telemetry.snapshot().total_rotations, 0);

        telemetry.record(plan(1, PlanOutcome::Success));
        assert_eq!(telemetry.snapshot().total_rotations, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(telemetry.snapshot().total_rotations, 1);
    }

    #[tokio::test]
    async fn worker_persists_and_reload_restores() {
        let store = TelemetryStore::open_in_memory().unwrap();
        let (telemetry, worker) = Telemetry::with_store(settings(Duration::ZERO), store.clone()).unwrap();
        let task = tokio::spawn(worker.run());

        telemetry.record(plan(1, PlanOutcome::Success));
        telemetry.record(plan(2, PlanOutcome::Failed));
        drop(telemetry);
        task.await.unwrap();

        assert_eq!(store.len().unwrap(), 2);

        let (reloaded, _worker) = Telemetry::with_store(settings(Duration::ZERO), store).unwrap();
        assert_eq!(reloaded.snapshot().total_rotations, 2);
        assert_eq!(reloaded.last_plan_id(), Some(2));
    }

    #[tokio::test]
    async fn record_survives_dead_worker() {
        let store = TelemetryStore::open_in_memory().unwrap();
        let (telemetry, worker) = Telemetry::with_store(settings(Duration::ZERO), store).unwrap();
        drop(worker);

        telemetry.record(plan(1, PlanOutcome::Success));
        assert_eq!(telemetry.snapshot().total_rotations, 1);
    }
}
