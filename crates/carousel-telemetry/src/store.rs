//! TelemetryStore: redb-backed rotation history.
//!
//! Plans are JSON-serialized into a single table keyed by plan id. The
//! store supports on-disk and in-memory backends (the latter for tests).

use std::path::Path;
use std::sync::Arc;

use carousel_core::{PlanId, RotationPlan};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult};

/// Finished rotation plans keyed by plan id.
const PLANS: TableDefinition<u64, &[u8]> = TableDefinition::new("plans");

macro_rules! map_err {
    ($variant:ident) => {
        |e| TelemetryError::$variant(e.to_string())
    };
}

/// Persistent rotation history.
#[derive(Clone)]
pub struct TelemetryStore {
    db: Arc<Database>,
}

impl TelemetryStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> TelemetryResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "telemetry store opened");
        Ok(store)
    }

    /// Ephemeral in-memory store.
    pub fn open_in_memory() -> TelemetryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> TelemetryResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a plan.
    pub fn put_plan(&self, plan: &RotationPlan) -> TelemetryResult<()> {
        let value = serde_json::to_vec(plan).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            table
                .insert(plan.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = plan.id, "plan persisted");
        Ok(())
    }

    /// All stored plans in id order.
    pub fn list_plans(&self) -> TelemetryResult<Vec<RotationPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        let mut plans = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let plan: RotationPlan =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Highest stored plan id, if any.
    pub fn max_plan_id(&self) -> TelemetryResult<Option<PlanId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        let last = table.last().map_err(map_err!(Read))?;
        Ok(last.map(|(key, _)| key.value()))
    }

    pub fn len(&self) -> TelemetryResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    pub fn is_empty(&self) -> TelemetryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop plans finished before `min_finished_at`, then the oldest ids
    /// beyond `max_count`. Returns how many were removed.
    pub fn prune(&self, min_finished_at: u64, max_count: usize) -> TelemetryResult<usize> {
        let plans = self.list_plans()?;
        let mut doomed: Vec<PlanId> = plans
            .iter()
            .filter(|p| p.finished_at.unwrap_or(p.started_at) < min_finished_at)
            .map(|p| p.id)
            .collect();
        let survivors = plans.len() - doomed.len();
        if survivors > max_count {
            let oldest: Vec<PlanId> = plans
                .iter()
                .filter(|p| !doomed.contains(&p.id))
                .take(survivors - max_count)
                .map(|p| p.id)
                .collect();
            doomed.extend(oldest);
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            for id in &doomed {
                table.remove(*id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed = doomed.len(), "telemetry store pruned");
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use carousel_core::{PlanOutcome, Trigger};

    use super::*;

    fn plan(id: PlanId, finished_at: u64) -> RotationPlan {
        let mut plan = RotationPlan::begin(id, Trigger::Scheduled, BTreeSet::new(), finished_at);
        plan.finish(PlanOutcome::Success, None, None, finished_at);
        plan
    }

    #[test]
    fn put_and_list_in_id_order() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store.put_plan(&plan(2, 200)).unwrap();
        store.put_plan(&plan(1, 100)).unwrap();

        let ids: Vec<_> = store.list_plans().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.max_plan_id().unwrap(), Some(2));
    }

    #[test]
    fn empty_store_has_no_max_id() {
        let store = TelemetryStore::open_in_memory().unwrap();
        assert_eq!(store.max_plan_id().unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn prune_by_window_then_count() {
        let store = TelemetryStore::open_in_memory().unwrap();
        for id in 1..=6 {
            store.put_plan(&plan(id, id * 100)).unwrap();
        }

        // 1 and 2 are outside the window; 3 is the oldest beyond count 3.
        assert_eq!(store.prune(250, 3).unwrap(), 3);
        let ids: Vec<_> = store.list_plans().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.redb");
        {
            let store = TelemetryStore::open(&path).unwrap();
            store.put_plan(&plan(7, 700)).unwrap();
        }
        let store = TelemetryStore::open(&path).unwrap();
        assert_eq!(store.list_plans().unwrap(), vec![plan(7, 700)]);
    }
}
