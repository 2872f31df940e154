//! τ-Store (component A) — per-task-type runtime estimate with EMA updates.
//!
//! Mirrors the teacher's `AgentRateLimiter` shape in `server/src/api.rs`: an
//! `Arc<RwLock<HashMap<...>>>` guarding a small fixed-key map, read far more
//! often than written. The store never errors — scheduling must always be
//! able to pull a τ (§4.1).

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::Connection;
use shared::model::{ResourceVector, TaskType};
use tracing::{debug, warn};

use crate::database::db_tau;

/// Thread-safe map of task type to τ (seconds). Six keys always present.
pub struct TauStore {
    values: RwLock<HashMap<TaskType, f64>>,
    ema_lambda: f64,
}

impl TauStore {
    /// Loads initial values from the database, falling back to the fixed
    /// defaults table (§3) for any type missing a row.
    pub fn load(conn: &Connection, ema_lambda: f64) -> anyhow::Result<Self> {
        let mut values = HashMap::new();
        for task_type in TaskType::ALL {
            values.insert(task_type, db_tau::get(conn, task_type)?);
        }
        Ok(Self {
            values: RwLock::new(values),
            ema_lambda: ema_lambda.clamp(0.0, 1.0),
        })
    }

    #[cfg(test)]
    fn new_for_test(ema_lambda: f64) -> Self {
        let mut values = HashMap::new();
        for task_type in TaskType::ALL {
            values.insert(task_type, task_type.default_tau_seconds());
        }
        Self {
            values: RwLock::new(values),
            ema_lambda,
        }
    }

    /// `Get(type) → τ`. Unknown/empty types fall back to `mixed`'s value,
    /// which is itself seeded from the fixed default table.
    pub fn get(&self, task_type: TaskType) -> f64 {
        let values = self.values.read().expect("tau store lock poisoned");
        values
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| task_type.default_tau_seconds())
    }

    /// `Update(type, actual_runtime_s)`: EMA step. Invalid input (non-positive
    /// runtime) is silently ignored — scheduling must never block on bad data.
    pub fn update(&self, conn: &Connection, task_type: TaskType, actual_runtime_s: f64) {
        if !(actual_runtime_s > 0.0) || !actual_runtime_s.is_finite() {
            debug!(?task_type, actual_runtime_s, "ignoring invalid tau update");
            return;
        }
        let new_tau = {
            let mut values = self.values.write().expect("tau store lock poisoned");
            let prev = values
                .get(&task_type)
                .copied()
                .unwrap_or_else(|| task_type.default_tau_seconds());
            let updated = self.ema_lambda * actual_runtime_s + (1.0 - self.ema_lambda) * prev;
            values.insert(task_type, updated);
            updated
        };
        if let Err(e) = db_tau::set(conn, task_type, new_tau) {
            warn!(?task_type, error = ?e, "failed to persist tau update");
        }
    }

    /// `Set(type, τ)`: overwrite, ignored if `τ ≤ 0`.
    pub fn set(&self, conn: &Connection, task_type: TaskType, tau: f64) {
        if !(tau > 0.0) {
            return;
        }
        {
            let mut values = self.values.write().expect("tau store lock poisoned");
            values.insert(task_type, tau);
        }
        if let Err(e) = db_tau::set(conn, task_type, tau) {
            warn!(?task_type, error = ?e, "failed to persist tau set");
        }
    }

    /// `GetAll()`: snapshot copy of the map.
    pub fn get_all(&self) -> HashMap<TaskType, f64> {
        self.values.read().expect("tau store lock poisoned").clone()
    }
}

/// Infer task type from requested resources when the submitter omits a tag
/// (§4.1's decision table, re-exported here for call-site convenience).
pub fn infer_task_type(req: &ResourceVector) -> TaskType {
    TaskType::infer(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_falls_back_to_default_for_unseeded_store() {
        let store = TauStore::new_for_test(0.2);
        assert_eq!(store.get(TaskType::CpuLight), 5.0);
    }

    #[test]
    fn update_applies_ema_and_ignores_invalid_input() {
        let conn = Connection::open_in_memory().unwrap();
        db_tau::create_table(&conn).unwrap();
        let store = TauStore::load(&conn, 0.2).unwrap();

        store.update(&conn, TaskType::CpuLight, 10.0);
        assert_eq!(store.get(TaskType::CpuLight), 0.2 * 10.0 + 0.8 * 5.0);

        let before = store.get(TaskType::CpuLight);
        store.update(&conn, TaskType::CpuLight, 0.0);
        store.update(&conn, TaskType::CpuLight, -5.0);
        assert_eq!(store.get(TaskType::CpuLight), before, "non-positive runtime must be ignored");
    }

    #[test]
    fn ema_converges_to_constant_actual_runtime() {
        let conn = Connection::open_in_memory().unwrap();
        db_tau::create_table(&conn).unwrap();
        let store = TauStore::load(&conn, 0.2).unwrap();
        let actual = 8.0;
        for _ in 0..200 {
            store.update(&conn, TaskType::Mixed, actual);
        }
        assert!((store.get(TaskType::Mixed) - actual).abs() < 1e-6);
    }

    #[test]
    fn set_ignores_non_positive_tau() {
        let conn = Connection::open_in_memory().unwrap();
        db_tau::create_table(&conn).unwrap();
        let store = TauStore::load(&conn, 0.2).unwrap();
        store.set(&conn, TaskType::CpuHeavy, 0.0);
        assert_eq!(store.get(TaskType::CpuHeavy), TaskType::CpuHeavy.default_tau_seconds());
    }

    #[test]
    fn get_all_has_six_entries() {
        let store = TauStore::new_for_test(0.2);
        assert_eq!(store.get_all().len(), 6);
    }
}
