use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Expected generation per local clock hour, in kWh.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HourlyForecast {
    pub kwh_by_hour: BTreeMap<u32, f64>,
}

impl HourlyForecast {
    pub fn new(kwh_by_hour: BTreeMap<u32, f64>) -> Self {
        Self { kwh_by_hour }
    }

    /// Generation expected between `now` and `end_minute` (minute of day).
    /// The current hour is prorated by the minutes left in it.
    pub fn remaining_until(&self, now: &NaiveDateTime, end_minute: u32) -> f64 {
        let now_minute = now.hour() * 60 + now.minute();
        if end_minute <= now_minute {
            return 0.0;
        }
        self.kwh_by_hour
            .iter()
            .map(|(&hour, &kwh)| {
                let start = hour * 60;
                let end = start + 60;
                let from = start.max(now_minute);
                let to = end.min(end_minute);
                if to <= from {
                    0.0
                } else {
                    kwh.max(0.0) * f64::from(to - from) / 60.0
                }
            })
            .sum()
    }
}

#[async_trait]
pub trait SolarForecaster: Send + Sync {
    /// Hourly forecast for a local date, `None` when no forecast is available.
    async fn hourly_for(&self, date: NaiveDate) -> Result<Option<HourlyForecast>>;
}

/// Sine-shaped clear-sky curve scaled by a cloud factor, used in simulation builds.
#[derive(Debug, Clone)]
pub struct ClearSkySolarForecaster {
    pub peak_kw: f64,
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
}

impl Default for ClearSkySolarForecaster {
    fn default() -> Self {
        Self {
            peak_kw: 7.6,
            sunrise: 6.0,
            sunset: 20.0,
            cloud_factor: 0.8,
        }
    }
}

#[async_trait]
impl SolarForecaster for ClearSkySolarForecaster {
    async fn hourly_for(&self, _date: NaiveDate) -> Result<Option<HourlyForecast>> {
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let kwh_by_hour = (0..24u32)
            .map(|h| {
                let mid = f64::from(h) + 0.5;
                let kwh = if mid < self.sunrise || mid > self.sunset {
                    0.0
                } else {
                    let x = (mid - self.sunrise) / day_len;
                    (std::f64::consts::PI * x).sin().max(0.0) * self.peak_kw * self.cloud_factor
                };
                (h, kwh)
            })
            .collect();
        Ok(Some(HourlyForecast { kwh_by_hour }))
    }
}

/// Provider with nothing to offer; keeps arbitrage permanently "not feasible".
#[derive(Debug, Clone, Default)]
pub struct NoSolarForecast;

#[async_trait]
impl SolarForecaster for NoSolarForecast {
    async fn hourly_for(&self, _date: NaiveDate) -> Result<Option<HourlyForecast>> {
        Ok(None)
    }
}
