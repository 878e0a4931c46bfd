use serde::{Deserialize, Serialize};

use super::SiteBatteryInfo;
use crate::config::BatteryConfig;

/// Usable energy and power of the installed battery bank.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BatteryCapacity {
    pub capacity_kwh: f64,
    pub max_power_kw: f64,
    pub source: CapacitySource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapacitySource {
    Device,
    Defaults,
}

/// Lowest power figure the timing math will divide by.
const MIN_POWER_KW: f64 = 0.1;

impl BatteryCapacity {
    pub fn defaults(cfg: &BatteryConfig) -> Self {
        Self {
            capacity_kwh: cfg.default_capacity_kwh,
            max_power_kw: cfg.default_max_power_kw.max(MIN_POWER_KW),
            source: CapacitySource::Defaults,
        }
    }

    /// Build from the site's battery description, filling gaps from static defaults.
    ///
    /// Capacity prefers the reported total, then unit count x per-unit size.
    pub fn from_site(info: &SiteBatteryInfo, cfg: &BatteryConfig) -> Self {
        let reported_capacity = info
            .total_capacity_kwh
            .filter(|kwh| *kwh > 0.0)
            .or_else(|| {
                info.battery_count
                    .filter(|n| *n > 0)
                    .map(|n| f64::from(n) * cfg.unit_capacity_kwh)
            });
        let reported_power = info
            .nameplate_power_w
            .filter(|w| *w > 0.0)
            .map(|w| w / 1000.0);

        let source = if reported_capacity.is_some() || reported_power.is_some() {
            CapacitySource::Device
        } else {
            CapacitySource::Defaults
        };

        Self {
            capacity_kwh: reported_capacity.unwrap_or(cfg.default_capacity_kwh),
            max_power_kw: reported_power
                .unwrap_or(cfg.default_max_power_kw)
                .max(MIN_POWER_KW),
            source,
        }
    }

    pub fn kwh_for_pct(&self, pct: f64) -> f64 {
        pct / 100.0 * self.capacity_kwh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_from_unit_count() {
        let info = SiteBatteryInfo {
            battery_count: Some(1),
            total_capacity_kwh: None,
            nameplate_power_w: Some(5800.0),
        };
        let cap = BatteryCapacity::from_site(&info, &BatteryConfig::default());
        assert_eq!(cap.capacity_kwh, 13.5);
        assert!((cap.max_power_kw - 5.8).abs() < 1e-9);
        assert_eq!(cap.source, CapacitySource::Device);
    }

    #[test]
    fn test_reported_total_wins_over_count() {
        let info = SiteBatteryInfo {
            battery_count: Some(3),
            total_capacity_kwh: Some(30.0),
            nameplate_power_w: None,
        };
        let cap = BatteryCapacity::from_site(&info, &BatteryConfig::default());
        assert_eq!(cap.capacity_kwh, 30.0);
        assert_eq!(cap.max_power_kw, 11.5);
    }

    #[test]
    fn test_empty_info_uses_defaults() {
        let cap = BatteryCapacity::from_site(&SiteBatteryInfo::default(), &BatteryConfig::default());
        assert_eq!(cap, BatteryCapacity::defaults(&BatteryConfig::default()));
        assert_eq!(cap.capacity_kwh, 27.0);
    }

    #[test]
    fn test_kwh_for_pct() {
        let cap = BatteryCapacity::defaults(&BatteryConfig::default());
        assert!((cap.kwh_for_pct(80.0) - 21.6).abs() < 1e-9);
    }
}
