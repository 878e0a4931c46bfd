//! Peak-export state machine.
//!
//! Idle -> PeakHold -> Dumping -> Complete -> Idle, once per billing day. The
//! machine is driven by [`PeakExportOptimizer::tick`] with an explicit `now`,
//! owns its state exclusively, and publishes a read-only snapshot after every
//! mutation. Device writes are independent calls; a failed write is logged and
//! left for the next tick's drift correction.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

use super::arbitrage::{self, ArbitrageInput, ArbitrageOutcome};
use super::persistence::OptimizerStore;
use super::state::{
    stamp, CleanGridInfo, Decision, LastCalculation, LocalStamp, OptimizerParams, OptimizerState,
    OptimizerStatus, Phase, RestorePoint, TouContext,
};
use super::timing::{self, evaluate_dump_timing, DumpTiming, DumpTimingInput, Recovery};
use crate::config::{ArbitrageConfig, BatteryConfig, CleanGridConfig, Config, OptimizerConfig};
use crate::domain::{
    is_weekday, peak_start_minutes, resolve_period, BatteryCapacity, DeviceCommand, DeviceGateway,
    DeviceSettings, ExportRule, LiveStatus, OperationMode, PeriodInfo, PeriodKind, TariffSchedule,
};
use crate::forecast::{GridMixSource, LoadEstimator, SolarForecaster};
use crate::notify::{notify_best_effort, Notification, NotificationSink};
use crate::repo::StateStore;

/// Grid import above this while dumping means the home is not covered.
const PAUSE_IMPORT_W: f64 = 100.0;
/// Import must fall to about zero before export resumes.
const RESUME_IMPORT_W: f64 = 20.0;
/// Load protection only pauses while there is this much above the floor.
const LOAD_PROTECT_MARGIN_PCT: f64 = 5.0;
/// Reported reserve this far above the minimum while dumping is re-commanded.
const RESERVE_TOLERANCE_PCT: f64 = 2.0;
/// SOC within this of the floor counts as fully dumped.
const COMPLETE_MARGIN_PCT: f64 = 1.0;
/// A reserve this close to the minimum while idle is a leftover from a crash.
const STUCK_RESERVE_MARGIN_PCT: f64 = 1.0;

const SITE_REFRESH_MINUTES: i64 = 60;

/// External collaborators.
#[derive(Clone)]
pub struct OptimizerDeps {
    pub gateway: Arc<dyn DeviceGateway>,
    pub store: Arc<dyn StateStore>,
    pub solar: Arc<dyn SolarForecaster>,
    pub grid_mix: Arc<dyn GridMixSource>,
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub optimizer: OptimizerConfig,
    pub arbitrage: ArbitrageConfig,
    pub clean_grid: CleanGridConfig,
    pub battery: BatteryConfig,
    pub trace_capacity: usize,
}

impl MachineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            optimizer: cfg.optimizer.clone(),
            arbitrage: cfg.arbitrage.clone(),
            clean_grid: cfg.clean_grid.clone(),
            battery: cfg.battery.clone(),
            trace_capacity: cfg.controller.trace_capacity,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            arbitrage: ArbitrageConfig::default(),
            clean_grid: CleanGridConfig::default(),
            battery: BatteryConfig::default(),
            trace_capacity: 20,
        }
    }
}

pub struct PeakExportOptimizer {
    deps: OptimizerDeps,
    cfg: MachineConfig,
    tz: Tz,
    state: OptimizerState,
    persist: OptimizerStore,
    load: LoadEstimator,
    capacity: BatteryCapacity,
    tariff: Option<TariffSchedule>,
    site_refreshed_at: Option<DateTime<Utc>>,
    reserve_check_done: bool,
    last_arbitrage: Option<ArbitrageOutcome>,
    last_inputs: Option<LiveStatus>,
    last_evaluate_at: Option<LocalStamp>,
    fossil_pct: Option<f64>,
    offgrid: Arc<AtomicBool>,
    status: Arc<RwLock<OptimizerStatus>>,
}

impl PeakExportOptimizer {
    /// Build the machine and load whatever state the store holds. Call
    /// [`start`](Self::start) before the first tick.
    pub fn new(deps: OptimizerDeps, cfg: MachineConfig, tz: Tz) -> Self {
        let persist = OptimizerStore::new(deps.store.clone());
        let defaults = OptimizerParams::from_config(&cfg.optimizer);
        let state = persist.load(defaults, cfg.trace_capacity);
        let status = Arc::new(RwLock::new(OptimizerStatus::disabled(state.params)));
        Self {
            capacity: BatteryCapacity::defaults(&cfg.battery),
            deps,
            cfg,
            tz,
            state,
            persist,
            load: LoadEstimator::two_hour(),
            tariff: None,
            site_refreshed_at: None,
            reserve_check_done: false,
            last_arbitrage: None,
            last_inputs: None,
            last_evaluate_at: None,
            fossil_pct: None,
            offgrid: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    /// Share the off-grid flag owned by the arbitration registry.
    pub fn with_offgrid_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.offgrid = flag;
        self
    }

    pub fn status_handle(&self) -> Arc<RwLock<OptimizerStatus>> {
        self.status.clone()
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn capacity(&self) -> BatteryCapacity {
        self.capacity
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn offgrid_active(&self) -> bool {
        self.offgrid.load(Ordering::Relaxed)
    }

    fn think(&mut self, now: &DateTime<Tz>, message: impl Into<String>) {
        let message = message.into();
        debug!(phase = %self.state.phase, "{message}");
        self.state.trace.push(stamp(now), message);
    }

    fn set_phase(&mut self, phase: Phase, now: &DateTime<Tz>) {
        if self.state.phase != phase {
            info!(from = %self.state.phase, to = %phase, "optimizer phase change");
        }
        self.state.phase = phase;
        self.state.phase_since = Some(stamp(now));
        self.persist.save_phase(phase, self.state.phase_since);
    }

    async fn command(&self, command: DeviceCommand) -> bool {
        let gw = &self.deps.gateway;
        let result = match command {
            DeviceCommand::SetMode(mode) => gw.set_operation_mode(mode).await,
            DeviceCommand::SetReserve(pct) => gw.set_backup_reserve(pct).await,
            DeviceCommand::SetExportRule(rule) => gw.set_export_rule(rule).await,
            DeviceCommand::SetGridCharging(allowed) => gw.set_grid_charging(allowed).await,
        };
        match result {
            Ok(()) => {
                info!(?command, "device command sent");
                true
            }
            Err(e) => {
                error!(?command, error = %e, "device command failed");
                false
            }
        }
    }

    fn safe_defaults(&self) -> DeviceSettings {
        DeviceSettings {
            reserve_pct: self.cfg.optimizer.safe_default_reserve_pct,
            ..DeviceSettings::default()
        }
    }

    fn resolve(&self, now: &DateTime<Tz>) -> PeriodInfo {
        resolve_period(now, self.tariff.as_ref(), self.state.params.fallback_window())
    }

    async fn refresh_site(&mut self, now: &DateTime<Tz>) {
        let now_utc = now.with_timezone(&Utc);
        if let Some(at) = self.site_refreshed_at {
            if now_utc >= at && now_utc - at < Duration::minutes(SITE_REFRESH_MINUTES) {
                return;
            }
        }

        match self.deps.gateway.battery_info().await {
            Ok(info) => {
                self.capacity = BatteryCapacity::from_site(&info, &self.cfg.battery);
                debug!(
                    capacity_kwh = self.capacity.capacity_kwh,
                    max_power_kw = self.capacity.max_power_kw,
                    "battery capacity detected"
                );
            }
            Err(e) => warn!(error = %e, "battery info unavailable, keeping previous capacity"),
        }

        match self.deps.gateway.tariff_content().await {
            Ok(Some(doc)) => match TariffSchedule::from_site_json(&doc) {
                Ok(schedule) => self.tariff = Some(schedule),
                Err(e) => {
                    warn!(error = %e, "tariff unusable, using manual peak hours");
                    self.tariff = None;
                }
            },
            Ok(None) => self.tariff = None,
            Err(e) => {
                warn!(error = %e, "tariff fetch failed, keeping previous schedule");
                // Retry on the next tick rather than waiting out the full interval.
                return;
            }
        }
        self.site_refreshed_at = Some(now_utc);
    }

    /// Process start: revalidate the persisted phase against the clock.
    pub async fn start(&mut self, now: DateTime<Tz>) {
        if !self.state.enabled {
            self.publish(&now);
            return;
        }
        self.refresh_site(&now).await;
        let period = self.resolve(&now);
        let saved = self.state.phase;

        match timing::recover_phase(saved, period.in_peak) {
            Recovery::Resume(phase) => {
                self.think(&now, format!("Restarted during peak, resuming {phase} phase"));
                info!(%phase, "optimizer resumed after restart");
            }
            Recovery::FreshPeakHold => {
                if self.offgrid_active() {
                    self.think(&now, "Restarted during peak but off-grid mode is active");
                } else {
                    self.think(&now, "Restarted during peak, entering hold phase");
                    let status = self.deps.gateway.live_status().await.ok();
                    self.enter_peak_hold(&now, status.as_ref()).await;
                }
            }
            Recovery::PendingRestore(phase) => {
                self.think(&now, format!("Restarted after peak in {phase} phase, settings will be restored"));
                info!(%phase, "optimizer restarted outside peak, restore pending");
            }
            Recovery::Idle => {
                if saved != Phase::Idle {
                    self.set_phase(Phase::Idle, &now);
                }
            }
        }
        self.persist.save_progress(&self.state);
        self.publish(&now);
    }

    /// Operator enable. Enabling inside peak enters PeakHold straight away.
    pub async fn enable(&mut self, params: OptimizerParams, now: DateTime<Tz>) {
        self.state.params = params;
        self.state.enabled = true;
        self.persist.save_params(true, &params);
        info!(
            peak_start_hour = params.peak_start_hour,
            peak_end_hour = params.peak_end_hour,
            buffer_minutes = params.buffer_minutes,
            min_reserve_pct = params.min_reserve_pct,
            "optimizer enabled"
        );
        self.think(
            &now,
            format!(
                "Enabled: peak {}:00-{}:00, buffer {} min, minimum reserve {:.0}%",
                params.peak_start_hour, params.peak_end_hour, params.buffer_minutes, params.min_reserve_pct
            ),
        );

        self.refresh_site(&now).await;
        let period = self.resolve(&now);
        if period.in_peak && self.state.phase == Phase::Idle && !self.offgrid_active() {
            self.think(&now, "Enabled during peak, entering hold phase now");
            let status = self.deps.gateway.live_status().await.ok();
            self.enter_peak_hold(&now, status.as_ref()).await;
        }
        self.persist.save_progress(&self.state);
        self.publish(&now);
    }

    /// Operator disable. A peak in progress is ended first so the device is not
    /// left in peak configuration.
    pub async fn disable(&mut self, now: DateTime<Tz>) {
        if self.state.phase.is_peak_phase() {
            let phase = self.state.phase;
            self.think(&now, format!("Disabled during {phase} phase, restoring settings"));
            self.end_peak(&now).await;
        }
        if self.state.clean_grid_active {
            let mode = self.state.clean_grid_prev_mode.unwrap_or(OperationMode::Autonomous);
            self.command(DeviceCommand::SetMode(mode)).await;
            self.state.clean_grid_active = false;
            self.state.clean_grid_prev_mode = None;
        }
        if self.state.phase != Phase::Idle {
            self.set_phase(Phase::Idle, &now);
        }
        self.state.enabled = false;
        self.persist.save_params(false, &self.state.params);
        self.persist.save_progress(&self.state);
        info!("optimizer disabled");
        self.think(&now, "Disabled");
        self.publish(&now);
    }

    /// One evaluation. Never fails: every problem degrades to a logged no-op.
    pub async fn tick(&mut self, now: DateTime<Tz>) {
        if !self.state.enabled {
            self.publish(&now);
            return;
        }
        self.refresh_site(&now).await;
        self.last_evaluate_at = Some(stamp(&now));

        // Deferred while off-grid mode owns the reserve.
        if !self.reserve_check_done && !self.offgrid_active() {
            self.reserve_check_done = true;
            self.check_stuck_reserve(&now).await;
        }

        let status = match self.deps.gateway.live_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "live status unavailable, skipping evaluation");
                self.think(&now, "Waiting for device data");
                self.publish(&now);
                return;
            }
        };
        self.load.record(now.with_timezone(&Utc), status.home_power_w);
        self.last_inputs = Some(status.clone());
        self.think(
            &now,
            format!(
                "Battery at {:.1}%, solar {:.1} kW, home {:.1} kW, grid {:.1} kW",
                status.soc_percent,
                status.solar_power_w / 1000.0,
                status.home_power_w / 1000.0,
                status.grid_power_w / 1000.0
            ),
        );

        self.evaluate(&now, &status).await;
        self.persist.save_progress(&self.state);
        self.publish(&now);
    }

    async fn evaluate(&mut self, now: &DateTime<Tz>, status: &LiveStatus) {
        if let Some(hours) = self.stuck_for_hours(now) {
            let phase = self.state.phase;
            warn!(%phase, hours, "optimizer phase exceeded ceiling, forcing restore");
            self.think(now, format!("Phase {phase} stuck for {hours}h, forcing restore"));
            self.end_peak(now).await;
            return;
        }

        let period = self.resolve(now);
        if period.kind != PeriodKind::PartialPeak {
            self.last_arbitrage = None;
        }
        self.think(
            now,
            format!(
                "TOU check: currently {}{}",
                period.kind.label(),
                if period.in_peak { ", in peak window" } else { "" }
            ),
        );

        if !period.in_peak {
            if self.state.phase.is_peak_phase() {
                self.think(now, "Peak ended, restoring normal operation");
                self.end_peak(now).await;
            }
            self.describe_next_peak(now);
            if period.kind == PeriodKind::PartialPeak {
                self.run_arbitrage(now, status).await;
            }
            self.check_clean_grid(now, status).await;
            return;
        }

        match self.state.phase {
            Phase::Idle => {
                if self.offgrid_active() {
                    self.think(now, "Off-grid mode active, not taking control for peak");
                    return;
                }
                self.think(now, "Peak just started, entering hold phase");
                self.enter_peak_hold(now, Some(status)).await;
            }
            Phase::PeakHold => self.check_dump_timing(now, status, &period).await,
            Phase::Dumping => self.monitor_dump(now, status, &period).await,
            Phase::Complete => self.think(now, "Dump complete, holding until peak ends"),
        }
    }

    fn stuck_for_hours(&self, now: &DateTime<Tz>) -> Option<i64> {
        if !self.state.phase.is_controlling() {
            return None;
        }
        let since = self.state.phase_since?;
        let age = now.with_timezone(&Utc) - since.with_timezone(&Utc);
        (age > Duration::hours(self.cfg.optimizer.stuck_phase_ceiling_hours)).then(|| age.num_hours())
    }

    /// Once per process: a reserve sitting at the dump floor while idle means a
    /// previous run never restored it.
    async fn check_stuck_reserve(&mut self, now: &DateTime<Tz>) {
        if self.state.phase != Phase::Idle {
            return;
        }
        let status = match self.deps.gateway.live_status().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let min = self.state.params.min_reserve_pct;
        if status.backup_reserve_pct > min + STUCK_RESERVE_MARGIN_PCT {
            return;
        }
        let target = self.cfg.optimizer.safe_default_reserve_pct;
        warn!(
            reserve_pct = status.backup_reserve_pct,
            min_reserve_pct = min,
            target_pct = target,
            "reserve stuck at dump floor, restoring"
        );
        self.think(
            now,
            format!("Reserve stuck at {:.0}%, restoring to {target:.0}%", status.backup_reserve_pct),
        );
        self.command(DeviceCommand::SetReserve(target)).await;
        self.state.restore_point = None;
        self.persist.clear_restore_point();
    }

    async fn enter_peak_hold(&mut self, now: &DateTime<Tz>, status: Option<&LiveStatus>) {
        let mut captured = match self.deps.gateway.read_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "could not read device settings, capturing from telemetry");
                DeviceSettings {
                    mode: status.map_or(OperationMode::Autonomous, |s| s.operation_mode),
                    reserve_pct: status.map_or(self.cfg.optimizer.safe_default_reserve_pct, |s| {
                        s.backup_reserve_pct
                    }),
                    export_rule: ExportRule::BatteryOk,
                    grid_charging_allowed: true,
                }
            }
        };

        if self.state.clean_grid_active {
            if let Some(mode) = self.state.clean_grid_prev_mode {
                captured.mode = mode;
            }
            self.state.clean_grid_active = false;
            self.state.clean_grid_prev_mode = None;
        }

        let min = self.state.params.min_reserve_pct;
        if captured.reserve_pct <= min {
            let safe = self.cfg.optimizer.safe_default_reserve_pct;
            warn!(
                captured_pct = captured.reserve_pct,
                min_reserve_pct = min,
                "captured reserve looks like a leftover dump floor, using safe default"
            );
            self.think(
                now,
                format!("Captured reserve {:.0}% equals the dump floor, will restore {safe:.0}%", captured.reserve_pct),
            );
            captured.reserve_pct = safe;
        }

        let restore_point = RestorePoint::capture(captured);
        self.state.restore_point = Some(restore_point);
        self.persist.save_restore_point(&restore_point);
        self.set_phase(Phase::PeakHold, now);

        self.command(DeviceCommand::SetMode(OperationMode::SelfConsumption)).await;
        self.command(DeviceCommand::SetGridCharging(false)).await;
        info!(
            soc_percent = status.map(|s| s.soc_percent),
            restore_mode = %captured.mode,
            restore_reserve_pct = captured.reserve_pct,
            "peak hold entered"
        );
    }

    fn dump_timing(&self, now: &DateTime<Tz>, status: &LiveStatus, peak_end_minute: u32) -> DumpTiming {
        let load = self.load.estimate(now.with_timezone(&Utc), status.home_power_w);
        evaluate_dump_timing(&DumpTimingInput {
            soc_pct: status.soc_percent,
            min_reserve_pct: self.state.params.min_reserve_pct,
            capacity: self.capacity,
            home_load_kw: load.kw,
            minutes_remaining: timing::minutes_until(&now.naive_local(), peak_end_minute),
            buffer_minutes: f64::from(self.state.params.buffer_minutes),
            negligible_kwh: self.cfg.optimizer.negligible_dump_kwh,
        })
    }

    fn peak_end_minute(&self, period: &PeriodInfo) -> u32 {
        period
            .peak_end_minutes
            .unwrap_or(self.state.params.peak_end_hour * 60)
    }

    fn record_calculation(
        &mut self,
        now: &DateTime<Tz>,
        status: &LiveStatus,
        t: &DumpTiming,
        decision: Decision,
        reason: Option<String>,
    ) {
        let load = self.load.estimate(now.with_timezone(&Utc), status.home_power_w);
        self.state.last_calculation = Some(LastCalculation {
            time: stamp(now),
            battery_soc: status.soc_percent,
            available_kwh: t.available_kwh,
            home_load_kw: load.kw,
            net_export_kw: t.net_export_kw,
            minutes_needed: t.minutes_needed,
            minutes_remaining: t.minutes_remaining,
            trigger_at_minutes: if decision == Decision::Dump && self.state.phase == Phase::Dumping {
                0.0
            } else {
                t.trigger_at_minutes
            },
            decision,
            reason,
        });
    }

    async fn check_dump_timing(&mut self, now: &DateTime<Tz>, status: &LiveStatus, period: &PeriodInfo) {
        let t = self.dump_timing(now, status, self.peak_end_minute(period));
        match t.decision {
            Decision::Skip => {
                self.record_calculation(now, status, &t, Decision::Skip, Some("not enough energy to dump".into()));
                self.think(now, format!("Only {:.1} kWh available, not enough to dump", t.available_kwh));
                self.correct_drift(now, status).await;
            }
            Decision::Wait => {
                self.record_calculation(now, status, &t, Decision::Wait, None);
                self.think(
                    now,
                    format!(
                        "Need {:.0} min to dump {:.1} kWh, {:.0} min remain; trigger at {:.0} min",
                        t.minutes_needed, t.available_kwh, t.minutes_remaining, t.trigger_at_minutes
                    ),
                );
                self.correct_drift(now, status).await;
            }
            Decision::Dump => {
                self.record_calculation(now, status, &t, Decision::Dump, None);
                let finish = *now + Duration::seconds((t.minutes_needed * 60.0).round() as i64);
                self.think(
                    now,
                    format!("Trigger reached, starting dump, estimated finish {}", finish.format("%H:%M")),
                );
                info!(
                    available_kwh = t.available_kwh,
                    minutes_needed = t.minutes_needed,
                    minutes_remaining = t.minutes_remaining,
                    "starting battery dump"
                );
                self.start_dump(now, finish).await;
            }
        }
    }

    async fn start_dump(&mut self, now: &DateTime<Tz>, finish: DateTime<Tz>) {
        self.set_phase(Phase::Dumping, now);
        self.state.dump_started_at = Some(stamp(now));
        self.state.estimated_finish = Some(stamp(&finish));
        self.state.dump_paused = false;
        let min = self.state.params.min_reserve_pct;

        self.command(DeviceCommand::SetMode(OperationMode::Autonomous)).await;
        self.command(DeviceCommand::SetExportRule(ExportRule::BatteryOk)).await;
        self.command(DeviceCommand::SetReserve(min)).await;

        notify_best_effort(
            self.deps.notifier.as_ref(),
            Notification::info(
                "Battery Dump Started",
                format!(
                    "Exporting battery to grid for peak credits. Reserve set to {min:.0}%. Estimated finish: {}",
                    finish.format("%H:%M")
                ),
            ),
        )
        .await;
    }

    async fn monitor_dump(&mut self, now: &DateTime<Tz>, status: &LiveStatus, period: &PeriodInfo) {
        let min = self.state.params.min_reserve_pct;
        let importing = status.grid_power_w > PAUSE_IMPORT_W;
        let mut mode_sent = false;

        if importing && !self.state.dump_paused && status.soc_percent > min + LOAD_PROTECT_MARGIN_PCT {
            self.think(
                now,
                format!(
                    "Home load causing grid import ({:.1} kW), pausing export to serve home",
                    status.grid_power_w / 1000.0
                ),
            );
            info!(grid_power_w = status.grid_power_w, "pausing dump for home load");
            if self.command(DeviceCommand::SetMode(OperationMode::SelfConsumption)).await {
                self.state.dump_paused = true;
            }
            mode_sent = true;
        } else if self.state.dump_paused && status.grid_power_w <= RESUME_IMPORT_W {
            self.think(now, "Home load dropped, resuming export");
            info!("resuming dump");
            if self.command(DeviceCommand::SetMode(OperationMode::Autonomous)).await {
                self.state.dump_paused = false;
            }
            mode_sent = true;
        } else if self.state.dump_paused {
            self.think(
                now,
                format!("Still serving home, grid import {:.1} kW", status.grid_power_w / 1000.0),
            );
        }

        let t = self.dump_timing(now, status, self.peak_end_minute(period));
        if t.available_kwh > 0.0 {
            let finish = *now + Duration::seconds((t.minutes_needed * 60.0).round() as i64);
            self.state.estimated_finish = Some(stamp(&finish));
        }
        self.record_calculation(now, status, &t, Decision::Dump, None);
        self.think(
            now,
            format!(
                "Dumping: {:.1} kWh left, about {:.0} min to go",
                t.available_kwh, t.minutes_needed
            ),
        );

        if status.soc_percent <= min + COMPLETE_MARGIN_PCT {
            self.think(now, format!("Dump complete at {:.1}%, stopping export", status.soc_percent));
            info!(soc_percent = status.soc_percent, "dump complete");
            self.state.dump_paused = false;
            self.command(DeviceCommand::SetExportRule(ExportRule::PvOnly)).await;
            self.set_phase(Phase::Complete, now);
            return;
        }

        if !mode_sent {
            self.correct_drift(now, status).await;
        }
    }

    /// Re-command anything the device reports differently from what the current
    /// phase requires. This is the only retry path for failed or silently
    /// ignored writes.
    async fn correct_drift(&mut self, now: &DateTime<Tz>, status: &LiveStatus) {
        let min = self.state.params.min_reserve_pct;
        let expected_mode = match self.state.phase {
            Phase::PeakHold => OperationMode::SelfConsumption,
            Phase::Dumping if self.state.dump_paused => OperationMode::SelfConsumption,
            Phase::Dumping => OperationMode::Autonomous,
            _ => return,
        };

        if status.operation_mode != expected_mode {
            self.think(
                now,
                format!("Mode is {} but should be {expected_mode}, resending", status.operation_mode),
            );
            warn!(actual = %status.operation_mode, expected = %expected_mode, "operation mode drift");
            self.command(DeviceCommand::SetMode(expected_mode)).await;
        }

        if self.state.phase == Phase::Dumping && status.backup_reserve_pct > min + RESERVE_TOLERANCE_PCT {
            self.think(
                now,
                format!("Reserve at {:.0}% but should be {min:.0}%, resending", status.backup_reserve_pct),
            );
            warn!(actual_pct = status.backup_reserve_pct, expected_pct = min, "reserve drift");
            self.command(DeviceCommand::SetReserve(min)).await;
        }
    }

    /// Restore pre-peak settings and return to Idle.
    ///
    /// Uses the in-memory restore point, then the persisted one, then safe
    /// defaults. Clears both copies afterwards. A no-op outside a peak phase,
    /// which makes repeated calls harmless. Returns whether anything ran.
    pub async fn end_peak(&mut self, now: &DateTime<Tz>) -> bool {
        if !self.state.phase.is_peak_phase() {
            debug!("end peak requested while idle, nothing to restore");
            return false;
        }

        let restore_point = self
            .state
            .restore_point
            .or_else(|| self.persist.load_restore_point());
        let target = match restore_point {
            Some(rp) => rp.resolve(self.safe_defaults()),
            None => {
                warn!("no restore point found, restoring safe defaults");
                self.safe_defaults()
            }
        };

        self.command(DeviceCommand::SetMode(target.mode)).await;
        self.command(DeviceCommand::SetReserve(target.reserve_pct)).await;
        self.command(DeviceCommand::SetExportRule(target.export_rule)).await;
        self.command(DeviceCommand::SetGridCharging(target.grid_charging_allowed)).await;
        info!(
            mode = %target.mode,
            reserve_pct = target.reserve_pct,
            export_rule = %target.export_rule,
            grid_charging_allowed = target.grid_charging_allowed,
            "peak ended, settings restored"
        );

        notify_best_effort(
            self.deps.notifier.as_ref(),
            Notification::info(
                "Peak Ended",
                format!("Restored to {} mode with {:.0}% reserve.", target.mode, target.reserve_pct),
            ),
        )
        .await;

        self.set_phase(Phase::Idle, now);
        self.state.dump_started_at = None;
        self.state.estimated_finish = None;
        self.state.dump_paused = false;
        self.state.restore_point = None;
        self.persist.clear_restore_point();
        self.persist.save_progress(&self.state);
        true
    }

    fn describe_next_peak(&mut self, now: &DateTime<Tz>) {
        let local = now.naive_local();
        let start = peak_start_minutes(now, self.tariff.as_ref(), self.state.params.fallback_window());
        let message = match start {
            Some(start) => match timing::minutes_until_today(&local, start) {
                Some(m) if m >= 60 => format!(
                    "Peak starts at {:02}:{:02}, {}h {}m from now",
                    start / 60,
                    start % 60,
                    m / 60,
                    m % 60
                ),
                Some(m) => format!("Peak starts at {:02}:{:02}, {m}m from now", start / 60, start % 60),
                None => "Past peak hours, idle until tomorrow".to_string(),
            },
            None if !is_weekday(&local) => "Weekend, no peak period today".to_string(),
            None => "Off-peak, no actions needed".to_string(),
        };
        self.think(now, message);
    }

    /// Mid-peak diagnostics only; nothing here commands the device.
    async fn run_arbitrage(&mut self, now: &DateTime<Tz>, status: &LiveStatus) {
        let local = now.naive_local();
        let Some(start) = peak_start_minutes(now, self.tariff.as_ref(), self.state.params.fallback_window())
        else {
            self.last_arbitrage = None;
            return;
        };
        let forecast = match self.deps.solar.hourly_for(local.date()).await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "solar forecast unavailable");
                None
            }
        };
        let load = self.load.estimate(now.with_timezone(&Utc), status.home_power_w);
        let result = arbitrage::calculate(
            &ArbitrageInput {
                soc_pct: status.soc_percent,
                capacity_kwh: self.capacity.capacity_kwh,
                now: local,
                peak_start_minute: start,
                forecast: forecast.as_ref(),
                home_load_kw: load.kw,
                ev_load_kw: status.ev_charging_w.max(0.0) / 1000.0,
            },
            &self.cfg.arbitrage,
        );
        match &result {
            Ok(plan) => self.think(
                now,
                format!(
                    "Mid-peak arbitrage feasible: export {:.0}% ({:.1} kWh) down to {:.0}%, solar refills by peak",
                    plan.dump_pct, plan.dump_kwh, plan.target_reserve_pct
                ),
            ),
            Err(reason) => debug!(%reason, "mid-peak arbitrage not feasible"),
        }
        self.last_arbitrage = Some(ArbitrageOutcome::new(stamp(now), result));
    }

    /// Idle-only preference for battery over a fossil-heavy grid.
    async fn check_clean_grid(&mut self, now: &DateTime<Tz>, status: &LiveStatus) {
        if !self.cfg.clean_grid.enabled || self.offgrid_active() {
            return;
        }
        let fossil = match self.deps.grid_mix.fossil_pct().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "grid mix unavailable");
                None
            }
        };
        self.fossil_pct = fossil;
        let Some(fossil) = fossil else {
            return;
        };

        let threshold = self.cfg.clean_grid.fossil_threshold_pct;
        let dirty = fossil > threshold;
        let battery_ok = status.soc_percent > self.cfg.clean_grid.min_soc_pct;

        if dirty
            && battery_ok
            && !self.state.clean_grid_active
            && status.operation_mode != OperationMode::SelfConsumption
        {
            self.think(
                now,
                format!("Grid is {fossil:.0}% fossil (threshold {threshold:.0}%), switching to self-consumption"),
            );
            info!(fossil_pct = fossil, threshold_pct = threshold, "clean grid preference active");
            if self.command(DeviceCommand::SetMode(OperationMode::SelfConsumption)).await {
                self.state.clean_grid_active = true;
                self.state.clean_grid_prev_mode = Some(status.operation_mode);
            }
        } else if (!dirty || !battery_ok) && self.state.clean_grid_active {
            let mode = self.state.clean_grid_prev_mode.unwrap_or(OperationMode::Autonomous);
            self.think(now, format!("Grid at {fossil:.0}% fossil, returning to {mode}"));
            info!(fossil_pct = fossil, soc_percent = status.soc_percent, %mode, "clean grid preference cleared");
            if self.command(DeviceCommand::SetMode(mode)).await {
                self.state.clean_grid_active = false;
                self.state.clean_grid_prev_mode = None;
            }
        }
    }

    fn tou_context(&self, now: &DateTime<Tz>) -> TouContext {
        let local = now.naive_local();
        let period = self.resolve(now);
        let start = peak_start_minutes(now, self.tariff.as_ref(), self.state.params.fallback_window());
        TouContext {
            period_label: period.kind.label().to_string(),
            period_name: period.period_name.clone(),
            in_peak: period.in_peak,
            source: Some(period.source),
            is_weekday: is_weekday(&local),
            has_peak_today: start.is_some(),
            peak_start_minutes: start,
            peak_end_minutes: period.peak_end_minutes,
            minutes_until_peak: start
                .filter(|_| !period.in_peak)
                .and_then(|s| timing::minutes_until_today(&local, s)),
            rate_per_kwh: period.rate,
        }
    }

    fn publish(&self, now: &DateTime<Tz>) {
        let p = self.state.params;
        let snapshot = OptimizerStatus {
            enabled: self.state.enabled,
            phase: self.state.phase,
            phase_since: self.state.phase_since,
            peak_start_hour: p.peak_start_hour,
            peak_end_hour: p.peak_end_hour,
            buffer_minutes: p.buffer_minutes,
            min_reserve_pct: p.min_reserve_pct,
            dump_started_at: self.state.dump_started_at,
            estimated_finish: self.state.estimated_finish,
            dump_paused: self.state.dump_paused,
            last_calculation: self.state.last_calculation.clone(),
            last_arbitrage: self.last_arbitrage.clone(),
            restore_point: self.state.restore_point,
            tou: self.tou_context(now),
            clean_grid: CleanGridInfo {
                enabled: self.cfg.clean_grid.enabled,
                active: self.state.clean_grid_active,
                fossil_pct: self.fossil_pct,
                threshold_pct: self.cfg.clean_grid.fossil_threshold_pct,
            },
            capacity: Some(self.capacity),
            current_inputs: self.last_inputs.clone(),
            last_evaluate_at: self.last_evaluate_at,
            trace: self.state.trace.entries(),
        };
        *self.status.write() = snapshot;
    }
}
