//! Partial-peak arbitrage: may part of the battery be exported during mid-peak
//! because solar will refill it before full peak starts?
//!
//! Stateless and side-effect free. The caller decides whether to act.

use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use thiserror::Error;

use super::state::LocalStamp;
use crate::config::ArbitrageConfig;
use crate::forecast::HourlyForecast;

/// Hours of runway required before full peak; below this the battery cannot
/// both discharge and refill.
const MIN_HOURS_UNTIL_PEAK: f64 = 1.0;

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotFeasible {
    #[error("only {hours:.2} h until full peak")]
    TooCloseToPeak { hours: f64 },
    #[error("no solar forecast available")]
    NoForecast,
    #[error("no solar generation forecast before peak")]
    NoSolarRemaining,
    #[error("battery capacity unknown")]
    UnknownCapacity,
    #[error("dump of {dump_pct:.1}% is below the {min_pct:.0}% minimum")]
    DumpTooSmall { dump_pct: f64, min_pct: f64 },
}

#[derive(Debug, Clone)]
pub struct ArbitrageInput<'a> {
    pub soc_pct: f64,
    pub capacity_kwh: f64,
    pub now: NaiveDateTime,
    /// Minute of day at which full peak begins.
    pub peak_start_minute: u32,
    pub forecast: Option<&'a HourlyForecast>,
    pub home_load_kw: f64,
    pub ev_load_kw: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArbitrageCalculation {
    pub current_soc: f64,
    pub target_reserve_pct: f64,
    pub dump_pct: f64,
    pub dump_kwh: f64,
    pub hours_until_peak: f64,
    pub solar_remaining_kwh: f64,
    pub home_load_kw: f64,
    pub ev_load_kw: f64,
    pub projected_consumption_kwh: f64,
    pub net_recoverable_kwh: f64,
    pub safe_recoverable_kwh: f64,
    pub recoverable_pct: f64,
}

pub fn calculate(
    input: &ArbitrageInput<'_>,
    cfg: &ArbitrageConfig,
) -> Result<ArbitrageCalculation, NotFeasible> {
    let now_minutes = f64::from(input.now.hour() * 60 + input.now.minute())
        + f64::from(input.now.second()) / 60.0;
    let hours_until_peak = (f64::from(input.peak_start_minute) - now_minutes) / 60.0;
    if hours_until_peak <= MIN_HOURS_UNTIL_PEAK {
        return Err(NotFeasible::TooCloseToPeak {
            hours: hours_until_peak,
        });
    }
    if input.capacity_kwh <= 0.0 {
        return Err(NotFeasible::UnknownCapacity);
    }

    let forecast = input.forecast.ok_or(NotFeasible::NoForecast)?;
    let solar_remaining_kwh = forecast.remaining_until(&input.now, input.peak_start_minute);
    if solar_remaining_kwh <= 0.0 {
        return Err(NotFeasible::NoSolarRemaining);
    }

    let load_kw = input.home_load_kw.max(0.0) + input.ev_load_kw.max(0.0);
    let projected_consumption_kwh = load_kw * hours_until_peak;
    let net_recoverable_kwh = (solar_remaining_kwh - projected_consumption_kwh).max(0.0);
    let safe_recoverable_kwh = net_recoverable_kwh * (1.0 - cfg.safety_discount_pct / 100.0);
    let recoverable_pct = safe_recoverable_kwh / input.capacity_kwh * 100.0;

    let target_reserve_pct = cfg.normal_floor_pct.max(input.soc_pct - recoverable_pct);
    let dump_pct = input.soc_pct - target_reserve_pct;
    if dump_pct < cfg.min_dump_pct {
        return Err(NotFeasible::DumpTooSmall {
            dump_pct,
            min_pct: cfg.min_dump_pct,
        });
    }

    Ok(ArbitrageCalculation {
        current_soc: input.soc_pct,
        target_reserve_pct,
        dump_pct,
        dump_kwh: dump_pct / 100.0 * input.capacity_kwh,
        hours_until_peak,
        solar_remaining_kwh,
        home_load_kw: input.home_load_kw,
        ev_load_kw: input.ev_load_kw,
        projected_consumption_kwh,
        net_recoverable_kwh,
        safe_recoverable_kwh,
        recoverable_pct,
    })
}

/// Last calculator result, kept for the status view.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArbitrageOutcome {
    pub calculated_at: LocalStamp,
    pub feasible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ArbitrageCalculation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_feasible: Option<NotFeasible>,
}

impl ArbitrageOutcome {
    pub fn new(at: LocalStamp, result: Result<ArbitrageCalculation, NotFeasible>) -> Self {
        match result {
            Ok(plan) => Self {
                calculated_at: at,
                feasible: true,
                plan: Some(plan),
                not_feasible: None,
            },
            Err(reason) => Self {
                calculated_at: at,
                feasible: false,
                plan: None,
                not_feasible: Some(reason),
            },
        }
    }
}
