use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum::{Display, EnumDiscriminants, EnumString};
use thiserror::Error;

/// Errors surfaced by the remote device gateway.
///
/// Rate limiting is retried inside the gateway itself; by the time one of these
/// reaches the controller the outcome of the call is unknown and the next tick's
/// drift checks decide what to do about it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway rate limit exhausted")]
    RateLimited,
    #[error("gateway rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationMode {
    /// Serve the home from battery and solar, no battery export.
    SelfConsumption,
    /// Device-managed TOU mode; exports battery energy when the export rule allows it.
    Autonomous,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportRule {
    PvOnly,
    BatteryOk,
    Never,
}

/// The four writable settings the optimizer touches and later restores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub mode: OperationMode,
    pub reserve_pct: f64,
    pub export_rule: ExportRule,
    pub grid_charging_allowed: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            mode: OperationMode::Autonomous,
            reserve_pct: 20.0,
            export_rule: ExportRule::BatteryOk,
            grid_charging_allowed: true,
        }
    }
}

/// Live telemetry. Power values in watts; `grid_power_w` is positive while importing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveStatus {
    pub soc_percent: f64,
    pub battery_power_w: f64,
    pub solar_power_w: f64,
    pub grid_power_w: f64,
    pub home_power_w: f64,
    #[serde(default)]
    pub ev_charging_w: f64,
    pub operation_mode: OperationMode,
    pub backup_reserve_pct: f64,
}

/// Battery hardware description as reported by the site configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteBatteryInfo {
    pub battery_count: Option<u32>,
    pub total_capacity_kwh: Option<f64>,
    pub nameplate_power_w: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, EnumDiscriminants)]
#[strum_discriminants(name(CommandKind), derive(Hash, Display))]
pub enum DeviceCommand {
    SetMode(OperationMode),
    SetReserve(f64),
    SetExportRule(ExportRule),
    SetGridCharging(bool),
}

/// Reserve writes are always clamped to the device's accepted range.
pub fn clamp_reserve(pct: f64) -> f64 {
    if pct.is_nan() {
        return 0.0;
    }
    pct.clamp(0.0, 100.0)
}

/// Remote device command gateway.
///
/// Every write is independent: callers never assume ordering between them and
/// never assume a successful return means the device actually changed.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Current writable settings, read from the device rather than any cache.
    async fn read_settings(&self) -> Result<DeviceSettings, GatewayError>;
    async fn live_status(&self) -> Result<LiveStatus, GatewayError>;
    async fn battery_info(&self) -> Result<SiteBatteryInfo, GatewayError>;
    /// Raw tariff document from the site configuration, if the site has one.
    async fn tariff_content(&self) -> Result<Option<serde_json::Value>, GatewayError>;

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), GatewayError>;
    async fn set_backup_reserve(&self, pct: f64) -> Result<(), GatewayError>;
    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), GatewayError>;
    async fn set_grid_charging(&self, allowed: bool) -> Result<(), GatewayError>;
}

#[derive(Debug)]
struct SimSite {
    settings: DeviceSettings,
    soc_percent: f64,
    solar_power_w: f64,
    home_power_w: f64,
    grid_power_override_w: Option<f64>,
    ev_charging_w: f64,
    battery: SiteBatteryInfo,
    tariff: Option<serde_json::Value>,
    failing: HashSet<CommandKind>,
    ignore_reserve_writes: bool,
    offline: bool,
    log: Vec<DeviceCommand>,
}

/// In-process stand-in for the remote gateway.
///
/// Used by the `sim` build and by tests: it records every command, can be told
/// to fail specific command kinds, and can silently drop reserve writes the way
/// the real device occasionally does.
#[derive(Debug)]
pub struct SimulatedGateway {
    site: Mutex<SimSite>,
}

impl SimulatedGateway {
    pub fn new(settings: DeviceSettings, soc_percent: f64) -> Self {
        Self {
            site: Mutex::new(SimSite {
                settings,
                soc_percent,
                solar_power_w: 0.0,
                home_power_w: 1200.0,
                grid_power_override_w: None,
                ev_charging_w: 0.0,
                battery: SiteBatteryInfo {
                    battery_count: Some(2),
                    total_capacity_kwh: None,
                    nameplate_power_w: Some(11_500.0),
                },
                tariff: None,
                failing: HashSet::new(),
                ignore_reserve_writes: false,
                offline: false,
                log: Vec::new(),
            }),
        }
    }

    pub fn set_soc(&self, soc_percent: f64) {
        self.site.lock().soc_percent = soc_percent.clamp(0.0, 100.0);
    }

    pub fn set_home_power(&self, watts: f64) {
        self.site.lock().home_power_w = watts;
    }

    pub fn set_solar_power(&self, watts: f64) {
        self.site.lock().solar_power_w = watts;
    }

    /// Force the reported grid power instead of deriving it from the power balance.
    pub fn set_grid_power(&self, watts: Option<f64>) {
        self.site.lock().grid_power_override_w = watts;
    }

    pub fn set_ev_charging(&self, watts: f64) {
        self.site.lock().ev_charging_w = watts;
    }

    pub fn set_battery_info(&self, info: SiteBatteryInfo) {
        self.site.lock().battery = info;
    }

    pub fn set_tariff(&self, tariff: Option<serde_json::Value>) {
        self.site.lock().tariff = tariff;
    }

    pub fn set_failing(&self, kind: CommandKind, failing: bool) {
        let mut site = self.site.lock();
        if failing {
            site.failing.insert(kind);
        } else {
            site.failing.remove(&kind);
        }
    }

    pub fn set_ignore_reserve_writes(&self, ignore: bool) {
        self.site.lock().ignore_reserve_writes = ignore;
    }

    pub fn set_offline(&self, offline: bool) {
        self.site.lock().offline = offline;
    }

    /// Overwrite settings directly, bypassing the command log.
    pub fn force_settings(&self, settings: DeviceSettings) {
        self.site.lock().settings = settings;
    }

    pub fn settings(&self) -> DeviceSettings {
        self.site.lock().settings
    }

    pub fn soc(&self) -> f64 {
        self.site.lock().soc_percent
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.site.lock().log.clone()
    }

    pub fn clear_commands(&self) {
        self.site.lock().log.clear();
    }

    fn apply(&self, command: DeviceCommand) -> Result<(), GatewayError> {
        let mut site = self.site.lock();
        if site.offline {
            return Err(GatewayError::Timeout);
        }
        let kind = CommandKind::from(&command);
        if site.failing.contains(&kind) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: format!("simulated failure for {kind}"),
            });
        }
        site.log.push(command);
        match command {
            DeviceCommand::SetMode(mode) => site.settings.mode = mode,
            DeviceCommand::SetReserve(pct) => {
                if !site.ignore_reserve_writes {
                    site.settings.reserve_pct = clamp_reserve(pct);
                }
            }
            DeviceCommand::SetExportRule(rule) => site.settings.export_rule = rule,
            DeviceCommand::SetGridCharging(allowed) => site.settings.grid_charging_allowed = allowed,
        }
        Ok(())
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(DeviceSettings::default(), 80.0)
    }
}

#[async_trait]
impl DeviceGateway for SimulatedGateway {
    async fn read_settings(&self) -> Result<DeviceSettings, GatewayError> {
        let site = self.site.lock();
        if site.offline {
            return Err(GatewayError::Timeout);
        }
        Ok(site.settings)
    }

    async fn live_status(&self) -> Result<LiveStatus, GatewayError> {
        let site = self.site.lock();
        if site.offline {
            return Err(GatewayError::Timeout);
        }
        let home = site.home_power_w + site.ev_charging_w;
        let grid = site
            .grid_power_override_w
            .unwrap_or_else(|| (home - site.solar_power_w).max(0.0));
        Ok(LiveStatus {
            soc_percent: site.soc_percent,
            battery_power_w: 0.0,
            solar_power_w: site.solar_power_w,
            grid_power_w: grid,
            home_power_w: site.home_power_w,
            ev_charging_w: site.ev_charging_w,
            operation_mode: site.settings.mode,
            backup_reserve_pct: site.settings.reserve_pct,
        })
    }

    async fn battery_info(&self) -> Result<SiteBatteryInfo, GatewayError> {
        let site = self.site.lock();
        if site.offline {
            return Err(GatewayError::Timeout);
        }
        Ok(site.battery.clone())
    }

    async fn tariff_content(&self) -> Result<Option<serde_json::Value>, GatewayError> {
        let site = self.site.lock();
        if site.offline {
            return Err(GatewayError::Timeout);
        }
        Ok(site.tariff.clone())
    }

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), GatewayError> {
        self.apply(DeviceCommand::SetMode(mode))
    }

    async fn set_backup_reserve(&self, pct: f64) -> Result<(), GatewayError> {
        self.apply(DeviceCommand::SetReserve(clamp_reserve(pct)))
    }

    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), GatewayError> {
        self.apply(DeviceCommand::SetExportRule(rule))
    }

    async fn set_grid_charging(&self, allowed: bool) -> Result<(), GatewayError> {
        self.apply(DeviceCommand::SetGridCharging(allowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_reserve() {
        assert_eq!(clamp_reserve(-5.0), 0.0);
        assert_eq!(clamp_reserve(150.0), 100.0);
        assert_eq!(clamp_reserve(42.5), 42.5);
        assert_eq!(clamp_reserve(f64::NAN), 0.0);
    }

    #[test]
    fn test_mode_and_rule_names() {
        assert_eq!(OperationMode::SelfConsumption.to_string(), "self_consumption");
        assert_eq!("battery_ok".parse::<ExportRule>().unwrap(), ExportRule::BatteryOk);
        assert_eq!(
            serde_json::to_value(ExportRule::PvOnly).unwrap(),
            serde_json::json!("pv_only")
        );
    }

    #[tokio::test]
    async fn test_simulated_gateway_records_commands() {
        let gw = SimulatedGateway::default();
        gw.set_operation_mode(OperationMode::SelfConsumption).await.unwrap();
        gw.set_backup_reserve(120.0).await.unwrap();

        assert_eq!(
            gw.commands(),
            vec![
                DeviceCommand::SetMode(OperationMode::SelfConsumption),
                DeviceCommand::SetReserve(100.0),
            ]
        );
        assert_eq!(gw.settings().reserve_pct, 100.0);
    }

    #[tokio::test]
    async fn test_simulated_gateway_failure_injection() {
        let gw = SimulatedGateway::default();
        gw.set_failing(CommandKind::SetExportRule, true);

        assert!(gw.set_export_rule(ExportRule::Never).await.is_err());
        assert!(gw.set_grid_charging(false).await.is_ok());
        assert_eq!(gw.settings().export_rule, ExportRule::BatteryOk);
    }

    #[tokio::test]
    async fn test_silent_reserve_noop() {
        let gw = SimulatedGateway::default();
        gw.set_ignore_reserve_writes(true);

        gw.set_backup_reserve(5.0).await.unwrap();
        let status = gw.live_status().await.unwrap();
        assert_eq!(status.backup_reserve_pct, 20.0);
    }

    #[tokio::test]
    async fn test_grid_power_from_balance() {
        let gw = SimulatedGateway::default();
        gw.set_home_power(2000.0);
        gw.set_solar_power(500.0);
        let status = gw.live_status().await.unwrap();
        assert_eq!(status.grid_power_w, 1500.0);

        gw.set_grid_power(Some(-3000.0));
        let status = gw.live_status().await.unwrap();
        assert_eq!(status.grid_power_w, -3000.0);
    }
}
