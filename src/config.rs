use anyhow::{Context, Result};
use chrono_tz::Tz;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub site: SiteConfig,
    pub controller: ControllerConfig,
    pub battery: BatteryConfig,
    pub optimizer: OptimizerConfig,
    pub arbitrage: ArbitrageConfig,
    pub clean_grid: CleanGridConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// IANA timezone name used for every TOU decision.
    pub timezone: String,
}

impl SiteConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid site timezone {:?}: {e}", self.timezone))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub optimizer_tick_seconds: u64,
    pub trace_capacity: usize,
}

/// Static fallbacks for the capacity model when the device does not report its size.
#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    pub default_capacity_kwh: f64,
    pub default_max_power_kw: f64,
    pub unit_capacity_kwh: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub buffer_minutes: u32,
    pub min_reserve_pct: f64,
    pub safe_default_reserve_pct: f64,
    pub negligible_dump_kwh: f64,
    pub stuck_phase_ceiling_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrageConfig {
    pub normal_floor_pct: f64,
    pub safety_discount_pct: f64,
    pub min_dump_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanGridConfig {
    pub enabled: bool,
    pub fossil_threshold_pct: f64,
    pub min_soc_pct: f64,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default = "default_mix_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_mix_ttl() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("PEC__").split("__"));
        figment.extract().context("failed to load configuration")
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            peak_start_hour: 17,
            peak_end_hour: 21,
            buffer_minutes: 15,
            min_reserve_pct: 5.0,
            safe_default_reserve_pct: 20.0,
            negligible_dump_kwh: 1.0,
            stuck_phase_ceiling_hours: 6,
        }
    }
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            normal_floor_pct: 20.0,
            safety_discount_pct: 15.0,
            min_dump_pct: 10.0,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            default_capacity_kwh: 27.0,
            default_max_power_kw: 11.5,
            unit_capacity_kwh: 13.5,
        }
    }
}

impl Default for CleanGridConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fossil_threshold_pct: 50.0,
            min_soc_pct: 25.0,
            source_url: None,
            cache_ttl_seconds: default_mix_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_parses() {
        let cfg: Config = Figment::new()
            .merge(Toml::string(include_str!("../config/default.toml")))
            .extract()
            .unwrap();
        assert_eq!(cfg.optimizer.peak_start_hour, 17);
        assert_eq!(cfg.controller.optimizer_tick_seconds, 120);
        assert!(cfg.site.tz().is_ok());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let site = SiteConfig { timezone: "Mars/Olympus".to_string() };
        assert!(site.tz().is_err());
    }
}
