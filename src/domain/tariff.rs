//! Time-of-use tariff model and period resolution.
//!
//! The resolver is a pure function of local time, an optional tariff schedule
//! and the manually configured peak window. It never fails: anything it cannot
//! classify from the tariff falls back to the manual weekday window, and the
//! manual window itself only ever reports peak on weekdays. Misclassification
//! therefore lands on "off-peak", where the optimizer does nothing.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum TariffError {
    #[error("tariff document has no seasons")]
    NoSeasons,
    #[error("tariff document could not be parsed: {0}")]
    Parse(String),
    #[error("invalid window in season {season}, period {period}: {reason}")]
    InvalidWindow {
        season: String,
        period: String,
        reason: String,
    },
}

/// Classification of a named TOU period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    SuperOffPeak,
    OffPeak,
    PartialPeak,
    OnPeak,
    Other,
}

impl PeriodKind {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "ON_PEAK" => PeriodKind::OnPeak,
            "PARTIAL_PEAK" | "MID_PEAK" => PeriodKind::PartialPeak,
            "OFF_PEAK" => PeriodKind::OffPeak,
            "SUPER_OFF_PEAK" => PeriodKind::SuperOffPeak,
            _ => PeriodKind::Other,
        }
    }

    /// Operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            PeriodKind::SuperOffPeak => "Super Off-Peak",
            PeriodKind::OffPeak => "Off-Peak",
            PeriodKind::PartialPeak => "Mid-Peak",
            PeriodKind::OnPeak => "Peak",
            PeriodKind::Other => "Other",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A weekly recurring time window. Days are 0 = Monday .. 6 = Sunday.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TouWindow {
    pub from_day_of_week: u32,
    pub to_day_of_week: u32,
    pub from_hour: u32,
    pub from_minute: u32,
    pub to_hour: u32,
    pub to_minute: u32,
}

impl TouWindow {
    pub fn start_minutes(&self) -> u32 {
        self.from_hour * 60 + self.from_minute
    }

    pub fn end_minutes(&self) -> u32 {
        self.to_hour * 60 + self.to_minute
    }

    /// 00:00 to 00:00 covers the whole day (flat weekend rates use this).
    pub fn is_all_day(&self) -> bool {
        self.start_minutes() == 0 && self.end_minutes() == 0
    }

    pub fn covers_day(&self, day_of_week: u32) -> bool {
        if self.from_day_of_week <= self.to_day_of_week {
            (self.from_day_of_week..=self.to_day_of_week).contains(&day_of_week)
        } else {
            day_of_week >= self.from_day_of_week || day_of_week <= self.to_day_of_week
        }
    }

    pub fn covers_minute(&self, minute_of_day: u32) -> bool {
        if self.is_all_day() {
            return true;
        }
        let (start, end) = (self.start_minutes(), self.end_minutes());
        if start < end {
            (start..end).contains(&minute_of_day)
        } else {
            minute_of_day >= start || minute_of_day < end
        }
    }

    /// Minute-of-day at which this window ends, 1440 for all-day windows.
    pub fn end_of_window(&self) -> u32 {
        if self.is_all_day() {
            MINUTES_PER_DAY
        } else {
            self.end_minutes()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TouPeriod {
    pub name: String,
    pub windows: Vec<TouWindow>,
    pub rate: Option<f64>,
}

impl TouPeriod {
    pub fn kind(&self) -> PeriodKind {
        PeriodKind::from_name(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Season {
    pub name: String,
    pub from_month: u32,
    pub to_month: u32,
    pub periods: Vec<TouPeriod>,
}

impl Season {
    pub fn contains_month(&self, month: u32) -> bool {
        if self.from_month <= self.to_month {
            (self.from_month..=self.to_month).contains(&month)
        } else {
            month >= self.from_month || month <= self.to_month
        }
    }
}

/// Read-only tariff schedule as published by the site configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TariffSchedule {
    pub seasons: Vec<Season>,
}

// Maps stay as `serde_json::Map` (insertion-ordered under `preserve_order`) so
// seasons and periods are matched in document order.
#[derive(Debug, Deserialize)]
struct RawTariff {
    #[serde(default)]
    seasons: Map<String, Value>,
    #[serde(default)]
    energy_charges: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawSeason {
    #[serde(rename = "fromMonth", default = "first_month")]
    from_month: u32,
    #[serde(rename = "toMonth", default = "last_month")]
    to_month: u32,
    #[serde(default)]
    tou_periods: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    #[serde(rename = "fromDayOfWeek", default)]
    from_day_of_week: u32,
    #[serde(rename = "toDayOfWeek", default = "last_day")]
    to_day_of_week: u32,
    #[serde(rename = "fromHour", default)]
    from_hour: u32,
    #[serde(rename = "fromMinute", default)]
    from_minute: u32,
    #[serde(rename = "toHour", default)]
    to_hour: u32,
    #[serde(rename = "toMinute", default)]
    to_minute: u32,
}

fn first_month() -> u32 {
    1
}
fn last_month() -> u32 {
    12
}
fn last_day() -> u32 {
    6
}

impl TariffSchedule {
    /// Parse the site's tariff document. Accepts the document itself or a site
    /// configuration that nests it under `tariff_content` / `components.tariff_content`.
    pub fn from_site_json(doc: &serde_json::Value) -> Result<Self, TariffError> {
        let content = [
            Some(doc),
            doc.get("tariff_content"),
            doc.get("components").and_then(|c| c.get("tariff_content")),
        ]
        .into_iter()
        .flatten()
        .find(|v| v.get("seasons").map_or(false, |s| s.as_object().map_or(false, |o| !o.is_empty())))
        .ok_or(TariffError::NoSeasons)?;

        let raw: RawTariff = serde_json::from_value(content.clone())
            .map_err(|e| TariffError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawTariff) -> Result<Self, TariffError> {
        if raw.seasons.is_empty() {
            return Err(TariffError::NoSeasons);
        }
        let mut seasons = Vec::with_capacity(raw.seasons.len());
        for (season_name, season_doc) in raw.seasons {
            let raw_season: RawSeason =
                serde_json::from_value(season_doc).map_err(|e| TariffError::Parse(e.to_string()))?;
            let rates = raw.energy_charges.get(&season_name);
            let mut periods = Vec::with_capacity(raw_season.tou_periods.len());
            for (period_name, windows_doc) in raw_season.tou_periods {
                let raw_windows: Vec<RawWindow> =
                    serde_json::from_value(windows_doc).map_err(|e| TariffError::Parse(e.to_string()))?;
                let windows = raw_windows
                    .into_iter()
                    .map(|w| validate_window(&season_name, &period_name, w))
                    .collect::<Result<Vec<_>, _>>()?;
                let rate = rates
                    .and_then(|r| r.get(&period_name))
                    .and_then(|v| v.as_f64());
                periods.push(TouPeriod {
                    name: period_name,
                    windows,
                    rate,
                });
            }
            seasons.push(Season {
                name: season_name,
                from_month: raw_season.from_month,
                to_month: raw_season.to_month,
                periods,
            });
        }
        Ok(Self { seasons })
    }

    pub fn season_for_month(&self, month: u32) -> Option<&Season> {
        self.seasons.iter().find(|s| s.contains_month(month))
    }
}

fn validate_window(season: &str, period: &str, w: RawWindow) -> Result<TouWindow, TariffError> {
    let invalid = |reason: String| TariffError::InvalidWindow {
        season: season.to_string(),
        period: period.to_string(),
        reason,
    };
    if w.from_day_of_week > 6 || w.to_day_of_week > 6 {
        return Err(invalid(format!(
            "day of week {}..{} out of range",
            w.from_day_of_week, w.to_day_of_week
        )));
    }
    if w.from_hour > 24 || w.to_hour > 24 || w.from_minute >= 60 || w.to_minute >= 60 {
        return Err(invalid(format!(
            "time {:02}:{:02}-{:02}:{:02} out of range",
            w.from_hour, w.from_minute, w.to_hour, w.to_minute
        )));
    }
    Ok(TouWindow {
        from_day_of_week: w.from_day_of_week,
        to_day_of_week: w.to_day_of_week,
        from_hour: w.from_hour,
        from_minute: w.from_minute,
        to_hour: w.to_hour,
        to_minute: w.to_minute,
    })
}

/// Manually configured peak hours, applied Monday to Friday only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackWindow {
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
}

impl FallbackWindow {
    fn in_peak(&self, local: &NaiveDateTime) -> bool {
        is_weekday(local) && (self.peak_start_hour..self.peak_end_hour).contains(&local.hour())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSource {
    Tariff,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodInfo {
    pub in_peak: bool,
    pub period_name: String,
    pub kind: PeriodKind,
    /// Minute-of-day when the current peak ends; `None` outside peak.
    pub peak_end_minutes: Option<u32>,
    pub source: PeriodSource,
    pub rate: Option<f64>,
}

pub fn is_weekday(local: &NaiveDateTime) -> bool {
    local.weekday().num_days_from_monday() < 5
}

/// Classify `now` into a TOU period.
pub fn resolve_period<Tz: TimeZone>(
    now: &DateTime<Tz>,
    schedule: Option<&TariffSchedule>,
    fallback: FallbackWindow,
) -> PeriodInfo {
    let local = now.naive_local();
    if let Some(info) = schedule.and_then(|s| match_schedule(s, &local)) {
        return info;
    }

    let in_peak = fallback.in_peak(&local);
    let kind = if in_peak {
        PeriodKind::OnPeak
    } else {
        PeriodKind::OffPeak
    };
    PeriodInfo {
        in_peak,
        period_name: if in_peak { "ON_PEAK" } else { "OFF_PEAK" }.to_string(),
        kind,
        peak_end_minutes: in_peak.then(|| fallback.peak_end_hour * 60),
        source: PeriodSource::Fallback,
        rate: None,
    }
}

fn match_schedule(schedule: &TariffSchedule, local: &NaiveDateTime) -> Option<PeriodInfo> {
    let season = schedule.season_for_month(local.month())?;
    let day = local.weekday().num_days_from_monday();
    let minute = local.hour() * 60 + local.minute();

    for period in &season.periods {
        for window in &period.windows {
            if !window.covers_day(day) || !window.covers_minute(minute) {
                continue;
            }
            let kind = period.kind();
            let in_peak = kind == PeriodKind::OnPeak;
            return Some(PeriodInfo {
                in_peak,
                period_name: period.name.clone(),
                kind,
                peak_end_minutes: in_peak.then(|| window.end_of_window()),
                source: PeriodSource::Tariff,
                rate: period.rate,
            });
        }
    }
    None
}

/// Minute-of-day at which full peak starts today, if today has one.
///
/// With a tariff season in force the tariff is authoritative (a flat weekend
/// returns `None`); otherwise the manual weekday window applies.
pub fn peak_start_minutes<Tz: TimeZone>(
    now: &DateTime<Tz>,
    schedule: Option<&TariffSchedule>,
    fallback: FallbackWindow,
) -> Option<u32> {
    let local = now.naive_local();
    if let Some(season) = schedule.and_then(|s| s.season_for_month(local.month())) {
        let day = local.weekday().num_days_from_monday();
        return season
            .periods
            .iter()
            .filter(|p| p.kind() == PeriodKind::OnPeak)
            .flat_map(|p| p.windows.iter())
            .find(|w| w.covers_day(day))
            .map(|w| w.start_minutes());
    }
    is_weekday(&local).then(|| fallback.peak_start_hour * 60)
}
