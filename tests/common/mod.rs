#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use chrono_tz::{America::Los_Angeles, Tz};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use std::sync::Arc;

use peak_export_controller::config::Config;
use peak_export_controller::domain::{DeviceSettings, ExportRule, OperationMode, SimulatedGateway};
use peak_export_controller::forecast::{NoSolarForecast, StaticGridMix};
use peak_export_controller::notify::RecordingNotifier;
use peak_export_controller::optimizer::{
    MachineConfig, OptimizerDeps, OptimizerParams, PeakExportOptimizer, Phase,
};
use peak_export_controller::repo::StateStore;

pub fn config() -> Config {
    Figment::new()
        .merge(Toml::string(include_str!("../../config/default.toml")))
        .extract()
        .expect("default config parses")
}

pub fn pre_peak_settings() -> DeviceSettings {
    DeviceSettings {
        mode: OperationMode::Autonomous,
        reserve_pct: 30.0,
        export_rule: ExportRule::PvOnly,
        grid_charging_allowed: true,
    }
}

pub struct Site {
    pub gateway: Arc<SimulatedGateway>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Site {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let gateway = SimulatedGateway::new(pre_peak_settings(), 85.0);
        gateway.set_grid_power(Some(0.0));
        Self {
            gateway: Arc::new(gateway),
            store,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn deps(&self) -> OptimizerDeps {
        OptimizerDeps {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            solar: Arc::new(NoSolarForecast),
            grid_mix: Arc::new(StaticGridMix(None)),
            notifier: self.notifier.clone(),
        }
    }

    /// A fresh optimizer over this site's store, as after a process restart.
    pub fn optimizer(&self) -> PeakExportOptimizer {
        PeakExportOptimizer::new(self.deps(), MachineConfig::from_config(&config()), Los_Angeles)
    }

    /// Crude battery model: while dumping and not paused the battery drains at
    /// 11.5 kW from a 27 kWh bank, never below the device reserve.
    pub fn advance_battery(&self, opt: &PeakExportOptimizer, minutes: i64) {
        let state = opt.state();
        if state.phase != Phase::Dumping || state.dump_paused {
            return;
        }
        let settings = self.gateway.settings();
        if settings.mode != OperationMode::Autonomous || settings.export_rule != ExportRule::BatteryOk {
            return;
        }
        let drained_pct = 11.5 * minutes as f64 / 60.0 / 27.0 * 100.0;
        let soc = self.soc();
        self.gateway.set_soc((soc - drained_pct).max(settings.reserve_pct));
    }

    pub fn soc(&self) -> f64 {
        self.gateway.soc()
    }
}

pub fn params() -> OptimizerParams {
    OptimizerParams::from_config(&config().optimizer)
}

/// Local wall-clock time at the test site. 2024-06-03 is a Monday.
pub fn local(day: u32, h: u32, m: u32) -> DateTime<Tz> {
    Los_Angeles
        .from_local_datetime(&NaiveDate::from_ymd_opt(2024, 6, day).unwrap().and_hms_opt(h, m, 0).unwrap())
        .single()
        .unwrap()
}

pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}
