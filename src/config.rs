use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub mqtt: MqttConfig,

    #[validate(nested)]
    pub location: LocationConfig,

    #[validate(nested)]
    pub hardware: HardwareConfig,

    #[validate(nested)]
    pub power_meter: PowerMeterConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub solar_charger: SolarChargerConfig,

    #[validate(nested)]
    pub grid_charger: GridChargerConfig,

    #[validate(nested)]
    pub power_limiter: PowerLimiterConfig,
}

impl Config {
    /// Load configuration from `config.toml` (or `$OMC_CONFIG`) with
    /// `OMC_*` environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("OMC_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let config: Config = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("OMC_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {path}"))?;

        config
            .validate()
            .context("Configuration failed validation")?;

        Ok(config)
    }
}

/// Shared MQTT client configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    pub client_id: String,
    pub username: String,
    pub password: String,

    /// Prefix for every topic this application publishes or subscribes to.
    pub topic_prefix: String,

    #[validate(range(min = 1, max = 3600))]
    pub publish_interval_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "open-microgrid-controller".to_string(),
            username: String::new(),
            password: String::new(),
            topic_prefix: "omc/".to_string(),
            publish_interval_secs: 5,
        }
    }
}

/// Installation site, used for sunrise/sunset arithmetic
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct LocationConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self { latitude: 52.52, longitude: 13.40 }
    }
}

/// Transport construction mode for devices without a real driver attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Simulated transports for development and testing
    #[default]
    Simulated,
    /// Mock transports with pre-programmed responses
    Mock,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
}

// ---------------------------------------------------------------------------
// power meter

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerMeterSource {
    #[default]
    Mqtt,
    HttpJson,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PowerMeterConfig {
    pub enabled: bool,
    pub source: PowerMeterSource,

    #[validate(nested)]
    pub mqtt: PowerMeterMqttConfig,

    #[validate(nested)]
    pub http_json: PowerMeterHttpJsonConfig,
}

/// Unit of a decoded power value; readings are normalized to watts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerUnit {
    #[default]
    Watts,
    KiloWatts,
    MilliWatts,
}

impl PowerUnit {
    pub fn to_watts(self, value: f32) -> f32 {
        match self {
            PowerUnit::Watts => value,
            PowerUnit::KiloWatts => value * 1000.0,
            PowerUnit::MilliWatts => value / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PowerMeterMqttConfig {
    /// Up to three phase values; the i-th entry feeds phase i+1.
    pub values: Vec<PowerMeterMqttValue>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PowerMeterMqttValue {
    pub topic: String,
    pub json_path: Option<String>,
    pub unit: PowerUnit,
    pub sign_inverted: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PowerMeterHttpJsonConfig {
    #[validate(range(min = 1, max = 3600))]
    pub polling_interval_secs: u64,

    #[validate(range(min = 1, max = 60))]
    pub request_timeout_secs: u64,

    /// When false, only the first value's request is issued and all values
    /// are extracted from its response document.
    pub individual_requests: bool,

    pub values: Vec<PowerMeterHttpJsonValue>,
}

impl Default for PowerMeterHttpJsonConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 5,
            request_timeout_secs: 5,
            individual_requests: false,
            values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PowerMeterHttpJsonValue {
    pub enabled: bool,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub json_path: Option<String>,
    pub unit: PowerUnit,
    pub sign_inverted: bool,
}

impl Default for PowerMeterHttpJsonValue {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            username: None,
            password: None,
            json_path: None,
            unit: PowerUnit::Watts,
            sign_inverted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// battery

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatteryProvider {
    #[default]
    Mqtt,
    PylontechCan,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    pub enabled: bool,
    pub provider: BatteryProvider,

    #[validate(nested)]
    pub mqtt: BatteryMqttConfig,

    /// User-configured cap on battery discharge current (A). Only applied
    /// below the SoC/voltage thresholds; 0 disables the cap.
    pub enable_discharge_current_limit: bool,
    pub discharge_current_limit: f32,

    #[validate(range(min = 0.0, max = 100.0))]
    pub discharge_current_limit_below_soc: f32,

    #[validate(range(min = 0.0, max = 65.0))]
    pub discharge_current_limit_below_voltage: f32,

    pub use_battery_reported_discharge_current_limit: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: BatteryProvider::Mqtt,
            mqtt: BatteryMqttConfig::default(),
            enable_discharge_current_limit: false,
            discharge_current_limit: 0.0,
            discharge_current_limit_below_soc: 0.0,
            discharge_current_limit_below_voltage: 0.0,
            use_battery_reported_discharge_current_limit: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BatteryMqttConfig {
    pub soc_topic: String,
    pub soc_json_path: Option<String>,
    pub voltage_topic: String,
    pub voltage_json_path: Option<String>,
    pub discharge_current_limit_topic: String,
    pub discharge_current_limit_json_path: Option<String>,
}

// ---------------------------------------------------------------------------
// solar charger

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolarChargerProvider {
    #[default]
    VictronMppt,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SolarChargerConfig {
    pub enabled: bool,
    pub provider: SolarChargerProvider,

    /// Number of VE.Direct charge controller instances (each takes one
    /// hardware serial port).
    #[validate(range(min = 1, max = 3))]
    pub victron_instances: u8,

    #[validate(nested)]
    pub mqtt: SolarChargerMqttConfig,
}

impl Default for SolarChargerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: SolarChargerProvider::VictronMppt,
            victron_instances: 1,
            mqtt: SolarChargerMqttConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SolarChargerMqttConfig {
    pub power_topic: String,
    pub power_json_path: Option<String>,
    pub power_unit: PowerUnit,
    pub voltage_topic: String,
    pub voltage_json_path: Option<String>,
}

// ---------------------------------------------------------------------------
// grid charger (Huawei rectifier)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GridChargerCanInterface {
    #[default]
    Mcp2515,
    Twai,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct GridChargerConfig {
    pub enabled: bool,
    pub can_interface: GridChargerCanInterface,

    /// Autonomous power steering against the grid power meter.
    pub auto_power_enabled: bool,
    pub emergency_charge_enabled: bool,

    /// Charge voltage setpoint re-asserted periodically in autonomous mode.
    #[validate(range(min = 41.0, max = 58.5))]
    pub voltage_limit: f32,

    /// Output voltage below which autonomous control re-arms.
    #[validate(range(min = 41.0, max = 58.5))]
    pub enable_voltage_limit: f32,

    #[validate(range(min = 50.0, max = 3000.0))]
    pub lower_power_limit: f32,

    #[validate(range(min = 100.0, max = 3000.0))]
    pub upper_power_limit: f32,

    pub target_power_consumption: f32,

    pub battery_soc_limits_enabled: bool,

    #[validate(range(min = 0.0, max = 100.0))]
    pub stop_battery_soc_threshold: f32,
}

impl Default for GridChargerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            can_interface: GridChargerCanInterface::Mcp2515,
            auto_power_enabled: false,
            emergency_charge_enabled: false,
            voltage_limit: 42.0,
            enable_voltage_limit: 42.0,
            lower_power_limit: 150.0,
            upper_power_limit: 2000.0,
            target_power_consumption: 0.0,
            battery_soc_limits_enabled: false,
            stop_battery_soc_threshold: 95.0,
        }
    }
}

// ---------------------------------------------------------------------------
// power limiter (DPL)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InverterPowerSource {
    #[default]
    Battery,
    Solar,
    SmartBuffer,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PowerLimiterInverterConfig {
    /// Radio serial of the governed inverter.
    pub serial: u64,
    pub is_governed: bool,

    /// False if the inverter feeds in between grid and this meter, i.e. the
    /// meter reading already includes its production.
    pub is_behind_power_meter: bool,

    pub power_source: InverterPowerSource,

    #[validate(range(min = 10, max = 2000))]
    pub lower_power_limit: u16,

    #[validate(range(min = 20, max = 4000))]
    pub upper_power_limit: u16,

    pub use_overscaling: bool,

    /// Percent of the expected per-MPPT yield below which an input counts as
    /// shaded.
    #[validate(range(min = 1, max = 100))]
    pub scaling_threshold: u8,
}

impl Default for PowerLimiterInverterConfig {
    fn default() -> Self {
        Self {
            serial: 0,
            is_governed: false,
            is_behind_power_meter: true,
            power_source: InverterPowerSource::Battery,
            lower_power_limit: 50,
            upper_power_limit: 800,
            use_overscaling: false,
            scaling_threshold: 98,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PowerLimiterConfig {
    pub enabled: bool,

    #[validate(nested)]
    pub inverters: Vec<PowerLimiterInverterConfig>,

    /// Grid import the DPL steers toward (negative pins export).
    pub target_power_consumption: i32,

    #[validate(range(min = 1, max = 500))]
    pub target_power_consumption_hysteresis: u16,

    /// Flat target applied while the power meter reading is stale.
    pub base_load_limit: u16,

    #[validate(range(min = 20, max = 20000))]
    pub total_upper_power_limit: u16,

    pub ignore_soc: bool,

    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_soc_start_threshold: f32,

    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_soc_stop_threshold: f32,

    pub voltage_start_threshold: f32,
    pub voltage_stop_threshold: f32,

    /// 1/A; corrects the measured battery voltage for the sag caused by the
    /// inverters' current draw.
    pub voltage_load_correction_factor: f32,

    pub solar_passthrough_enabled: bool,

    #[validate(range(min = 0.0, max = 100.0))]
    pub full_solar_passthrough_soc: f32,

    pub full_solar_passthrough_start_voltage: f32,
    pub full_solar_passthrough_stop_voltage: f32,

    pub battery_always_use_at_night: bool,

    /// Percent lost between power bus and inverter AC output.
    #[validate(range(min = 0, max = 10))]
    pub conduction_losses: u8,

    /// Local hour at which non-solar inverters are restarted daily;
    /// negative disables the feature.
    #[validate(range(min = -1, max = 23))]
    pub restart_hour: i8,

    /// Inverter whose DC input voltage stands in for the battery voltage
    /// when neither BMS nor charge controller provide one.
    pub inverter_serial_for_dc_voltage: u64,
    pub inverter_channel_for_dc_voltage: u8,
}

impl Default for PowerLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inverters: Vec::new(),
            target_power_consumption: 0,
            target_power_consumption_hysteresis: 25,
            base_load_limit: 100,
            total_upper_power_limit: 800,
            ignore_soc: false,
            battery_soc_start_threshold: 80.0,
            battery_soc_stop_threshold: 20.0,
            voltage_start_threshold: 50.0,
            voltage_stop_threshold: 49.0,
            voltage_load_correction_factor: 0.001,
            solar_passthrough_enabled: false,
            full_solar_passthrough_soc: 100.0,
            full_solar_passthrough_start_voltage: 100.0,
            full_solar_passthrough_stop_voltage: 100.0,
            battery_always_use_at_night: false,
            conduction_losses: 3,
            restart_hour: -1,
            inverter_serial_for_dc_voltage: 0,
            inverter_channel_for_dc_voltage: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverter_bounds_are_enforced() {
        let mut config = Config::default();
        config.power_limiter.inverters.push(PowerLimiterInverterConfig {
            scaling_threshold: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn power_unit_normalizes_to_watts() {
        assert_eq!(PowerUnit::Watts.to_watts(42.0), 42.0);
        assert_eq!(PowerUnit::KiloWatts.to_watts(1.5), 1500.0);
        assert_eq!(PowerUnit::MilliWatts.to_watts(2500.0), 2.5);
    }
}
