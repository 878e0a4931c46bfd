//! Key layout for optimizer state in the key-value store.
//!
//! One key per field so any subset can be read back after a restart. Store
//! failures are logged and swallowed: losing a write costs at most one restart's
//! worth of recovery accuracy, never a tick.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::state::{LocalStamp, OptimizerParams, OptimizerState, Phase, RestorePoint};
use crate::domain::{ExportRule, OperationMode};
use crate::repo::StateStore;

pub const ENABLED: &str = "optimizer.enabled";
pub const PHASE: &str = "optimizer.phase";
pub const PHASE_SINCE: &str = "optimizer.phase_since";
pub const PEAK_START_HOUR: &str = "optimizer.peak_start_hour";
pub const PEAK_END_HOUR: &str = "optimizer.peak_end_hour";
pub const BUFFER_MINUTES: &str = "optimizer.buffer_minutes";
pub const MIN_RESERVE_PCT: &str = "optimizer.min_reserve_pct";
pub const DUMP_STARTED_AT: &str = "optimizer.dump_started_at";
pub const ESTIMATED_FINISH: &str = "optimizer.estimated_finish";
pub const LAST_CALCULATION: &str = "optimizer.last_calculation";
pub const DUMP_PAUSED: &str = "optimizer.dump_paused";
pub const CLEAN_GRID_ACTIVE: &str = "optimizer.clean_grid_active";
pub const CLEAN_GRID_PREV_MODE: &str = "optimizer.clean_grid_prev_mode";

pub const RESTORE_MODE: &str = "optimizer.restore.mode";
pub const RESTORE_RESERVE_PCT: &str = "optimizer.restore.reserve_pct";
pub const RESTORE_EXPORT_RULE: &str = "optimizer.restore.export_rule";
pub const RESTORE_GRID_CHARGING: &str = "optimizer.restore.grid_charging";

#[derive(Clone)]
pub struct OptimizerStore {
    store: Arc<dyn StateStore>,
}

impl OptimizerStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(key, error = %e, "ignoring unreadable persisted value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "state store read failed");
                None
            }
        }
    }

    fn write(&self, entries: Vec<(String, Value)>) {
        if let Err(e) = self.store.set_many(entries) {
            warn!(error = %e, "state store write failed");
        }
    }

    /// Rebuild state from the store, falling back to `defaults` field by field.
    pub fn load(&self, defaults: OptimizerParams, trace_capacity: usize) -> OptimizerState {
        let params = OptimizerParams {
            peak_start_hour: self.read(PEAK_START_HOUR).unwrap_or(defaults.peak_start_hour),
            peak_end_hour: self.read(PEAK_END_HOUR).unwrap_or(defaults.peak_end_hour),
            buffer_minutes: self.read(BUFFER_MINUTES).unwrap_or(defaults.buffer_minutes),
            min_reserve_pct: self.read(MIN_RESERVE_PCT).unwrap_or(defaults.min_reserve_pct),
        };
        let mut state = OptimizerState::new(params, trace_capacity);
        state.enabled = self.read(ENABLED).unwrap_or(false);
        state.phase = self.read(PHASE).unwrap_or(Phase::Idle);
        state.phase_since = self.read(PHASE_SINCE);
        state.restore_point = self.load_restore_point();
        state.dump_started_at = self.read(DUMP_STARTED_AT);
        state.estimated_finish = self.read(ESTIMATED_FINISH);
        state.last_calculation = self.read(LAST_CALCULATION);
        state.dump_paused = self.read(DUMP_PAUSED).unwrap_or(false);
        state.clean_grid_active = self.read(CLEAN_GRID_ACTIVE).unwrap_or(false);
        state.clean_grid_prev_mode = self.read(CLEAN_GRID_PREV_MODE);
        state
    }

    pub fn load_restore_point(&self) -> Option<RestorePoint> {
        let rp = RestorePoint {
            mode: self.read::<OperationMode>(RESTORE_MODE),
            reserve_pct: self.read::<f64>(RESTORE_RESERVE_PCT),
            export_rule: self.read::<ExportRule>(RESTORE_EXPORT_RULE),
            grid_charging_allowed: self.read::<bool>(RESTORE_GRID_CHARGING),
        };
        (!rp.is_empty()).then_some(rp)
    }

    pub fn save_restore_point(&self, rp: &RestorePoint) {
        self.write(vec![
            entry(RESTORE_MODE, rp.mode),
            entry(RESTORE_RESERVE_PCT, rp.reserve_pct),
            entry(RESTORE_EXPORT_RULE, rp.export_rule),
            entry(RESTORE_GRID_CHARGING, rp.grid_charging_allowed),
        ]);
    }

    pub fn clear_restore_point(&self) {
        self.write(
            [RESTORE_MODE, RESTORE_RESERVE_PCT, RESTORE_EXPORT_RULE, RESTORE_GRID_CHARGING]
                .into_iter()
                .map(|k| (k.to_string(), Value::Null))
                .collect(),
        );
    }

    pub fn save_params(&self, enabled: bool, params: &OptimizerParams) {
        self.write(vec![
            entry(ENABLED, enabled),
            entry(PEAK_START_HOUR, params.peak_start_hour),
            entry(PEAK_END_HOUR, params.peak_end_hour),
            entry(BUFFER_MINUTES, params.buffer_minutes),
            entry(MIN_RESERVE_PCT, params.min_reserve_pct),
        ]);
    }

    pub fn save_phase(&self, phase: Phase, since: Option<LocalStamp>) {
        self.write(vec![entry(PHASE, phase), entry(PHASE_SINCE, since)]);
    }

    /// Everything that changes tick to tick. The restore point has its own
    /// write path so a lost in-memory copy never overwrites the persisted one.
    pub fn save_progress(&self, state: &OptimizerState) {
        self.write(vec![
            entry(DUMP_STARTED_AT, state.dump_started_at),
            entry(ESTIMATED_FINISH, state.estimated_finish),
            entry(LAST_CALCULATION, state.last_calculation.as_ref()),
            entry(DUMP_PAUSED, state.dump_paused),
            entry(CLEAN_GRID_ACTIVE, state.clean_grid_active),
            entry(CLEAN_GRID_PREV_MODE, state.clean_grid_prev_mode),
        ]);
    }
}

fn entry<T: Serialize>(key: &str, value: T) -> (String, Value) {
    (key.to_string(), serde_json::to_value(value).unwrap_or(Value::Null))
}
