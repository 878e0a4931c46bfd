use chrono::{DateTime, FixedOffset, Offset, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::{Display, EnumString};

use super::arbitrage::ArbitrageOutcome;
use crate::config::OptimizerConfig;
use crate::domain::{
    BatteryCapacity, DeviceSettings, ExportRule, FallbackWindow, LiveStatus, OperationMode,
    PeriodSource,
};

/// Timestamps are kept with the site's UTC offset at the time they were taken.
pub type LocalStamp = DateTime<FixedOffset>;

pub fn stamp<Tz: TimeZone>(now: &DateTime<Tz>) -> LocalStamp {
    now.with_timezone(&now.offset().fix())
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    PeakHold,
    Dumping,
    Complete,
}

impl Phase {
    /// Any phase that leaves the device in peak configuration and needs "end peak".
    pub fn is_peak_phase(self) -> bool {
        matches!(self, Phase::PeakHold | Phase::Dumping | Phase::Complete)
    }

    /// Phases in which the optimizer actively owns the device settings.
    pub fn is_controlling(self) -> bool {
        matches!(self, Phase::PeakHold | Phase::Dumping)
    }
}

/// Operator-set parameters, persisted with every enable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OptimizerParams {
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub buffer_minutes: u32,
    pub min_reserve_pct: f64,
}

impl OptimizerParams {
    pub fn from_config(cfg: &OptimizerConfig) -> Self {
        Self {
            peak_start_hour: cfg.peak_start_hour,
            peak_end_hour: cfg.peak_end_hour,
            buffer_minutes: cfg.buffer_minutes,
            min_reserve_pct: cfg.min_reserve_pct,
        }
    }

    pub fn fallback_window(&self) -> FallbackWindow {
        FallbackWindow {
            peak_start_hour: self.peak_start_hour,
            peak_end_hour: self.peak_end_hour,
        }
    }
}

/// Device settings captured at PeakHold entry.
///
/// Each field is independently optional: a partially persisted snapshot still
/// restores what it has and fills the rest from safe defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RestorePoint {
    pub mode: Option<OperationMode>,
    pub reserve_pct: Option<f64>,
    pub export_rule: Option<ExportRule>,
    pub grid_charging_allowed: Option<bool>,
}

impl RestorePoint {
    pub fn capture(settings: DeviceSettings) -> Self {
        Self {
            mode: Some(settings.mode),
            reserve_pct: Some(settings.reserve_pct),
            export_rule: Some(settings.export_rule),
            grid_charging_allowed: Some(settings.grid_charging_allowed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.reserve_pct.is_none()
            && self.export_rule.is_none()
            && self.grid_charging_allowed.is_none()
    }

    pub fn resolve(&self, defaults: DeviceSettings) -> DeviceSettings {
        DeviceSettings {
            mode: self.mode.unwrap_or(defaults.mode),
            reserve_pct: self.reserve_pct.unwrap_or(defaults.reserve_pct),
            export_rule: self.export_rule.unwrap_or(defaults.export_rule),
            grid_charging_allowed: self
                .grid_charging_allowed
                .unwrap_or(defaults.grid_charging_allowed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Wait,
    Dump,
    Skip,
}

/// Figures behind the most recent hold/dump decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastCalculation {
    pub time: LocalStamp,
    pub battery_soc: f64,
    pub available_kwh: f64,
    pub home_load_kw: f64,
    pub net_export_kw: f64,
    pub minutes_needed: f64,
    pub minutes_remaining: f64,
    pub trigger_at_minutes: f64,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub at: LocalStamp,
    pub message: String,
}

/// Bounded ring buffer of human-readable decisions. Diagnostics only.
#[derive(Debug, Clone)]
pub struct DecisionTrace {
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl DecisionTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, at: LocalStamp, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            at,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide optimizer state. Everything but `trace` is persisted.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub enabled: bool,
    pub phase: Phase,
    pub phase_since: Option<LocalStamp>,
    pub params: OptimizerParams,
    pub restore_point: Option<RestorePoint>,
    pub dump_started_at: Option<LocalStamp>,
    pub estimated_finish: Option<LocalStamp>,
    pub last_calculation: Option<LastCalculation>,
    pub dump_paused: bool,
    pub clean_grid_active: bool,
    pub clean_grid_prev_mode: Option<OperationMode>,
    pub trace: DecisionTrace,
}

impl OptimizerState {
    pub fn new(params: OptimizerParams, trace_capacity: usize) -> Self {
        Self {
            enabled: false,
            phase: Phase::Idle,
            phase_since: None,
            params,
            restore_point: None,
            dump_started_at: None,
            estimated_finish: None,
            last_calculation: None,
            dump_paused: false,
            clean_grid_active: false,
            clean_grid_prev_mode: None,
            trace: DecisionTrace::new(trace_capacity),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TouContext {
    pub period_label: String,
    pub period_name: String,
    pub in_peak: bool,
    pub source: Option<PeriodSource>,
    pub is_weekday: bool,
    pub has_peak_today: bool,
    pub peak_start_minutes: Option<u32>,
    pub peak_end_minutes: Option<u32>,
    pub minutes_until_peak: Option<i64>,
    /// Energy rate of the current tariff period, when the tariff publishes one.
    pub rate_per_kwh: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CleanGridInfo {
    pub enabled: bool,
    pub active: bool,
    pub fossil_pct: Option<f64>,
    pub threshold_pct: f64,
}

/// Read-only snapshot published after every mutation.
///
/// Readers treat it as advisory: it may lag the machine by one tick.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStatus {
    pub enabled: bool,
    pub phase: Phase,
    pub phase_since: Option<LocalStamp>,
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub buffer_minutes: u32,
    pub min_reserve_pct: f64,
    pub dump_started_at: Option<LocalStamp>,
    pub estimated_finish: Option<LocalStamp>,
    pub dump_paused: bool,
    pub last_calculation: Option<LastCalculation>,
    pub last_arbitrage: Option<ArbitrageOutcome>,
    pub restore_point: Option<RestorePoint>,
    pub tou: TouContext,
    pub clean_grid: CleanGridInfo,
    pub capacity: Option<BatteryCapacity>,
    pub current_inputs: Option<LiveStatus>,
    pub last_evaluate_at: Option<LocalStamp>,
    pub trace: Vec<TraceEntry>,
}

impl OptimizerStatus {
    pub fn disabled(params: OptimizerParams) -> Self {
        Self {
            enabled: false,
            phase: Phase::Idle,
            phase_since: None,
            peak_start_hour: params.peak_start_hour,
            peak_end_hour: params.peak_end_hour,
            buffer_minutes: params.buffer_minutes,
            min_reserve_pct: params.min_reserve_pct,
            dump_started_at: None,
            estimated_finish: None,
            dump_paused: false,
            last_calculation: None,
            last_arbitrage: None,
            restore_point: None,
            tou: TouContext::default(),
            clean_grid: CleanGridInfo::default(),
            capacity: None,
            current_inputs: None,
            last_evaluate_at: None,
            trace: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_phase_names_and_groups() {
        assert_eq!(Phase::PeakHold.to_string(), "peak_hold");
        assert_eq!("dumping".parse::<Phase>().unwrap(), Phase::Dumping);
        assert!(Phase::Complete.is_peak_phase());
        assert!(!Phase::Complete.is_controlling());
        assert!(!Phase::Idle.is_peak_phase());
    }

    #[test]
    fn test_trace_is_bounded() {
        let mut trace = DecisionTrace::new(3);
        let now = stamp(&Utc::now());
        for i in 0..5 {
            trace.push(now, format!("step {i}"));
        }
        let entries = trace.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "step 2");
        assert_eq!(entries[2].message, "step 4");
    }

    #[test]
    fn test_partial_restore_point_fills_defaults() {
        let rp = RestorePoint {
            mode: Some(OperationMode::SelfConsumption),
            reserve_pct: Some(0.0),
            ..Default::default()
        };
        let settings = rp.resolve(DeviceSettings::default());
        assert_eq!(settings.mode, OperationMode::SelfConsumption);
        // A zero reserve is a real value, not "missing".
        assert_eq!(settings.reserve_pct, 0.0);
        assert_eq!(settings.export_rule, ExportRule::BatteryOk);
        assert!(settings.grid_charging_allowed);
        assert!(RestorePoint::default().is_empty());
    }
}
