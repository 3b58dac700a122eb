//! Battery state shared between the provider that decodes it and the
//! consumers (power limiter, grid charger, MQTT telemetry).
//!
//! Every stat carries its own update timestamp; 0 means "never received".
//! Consumers decide freshness themselves, the hard bound for control
//! decisions being 60 s.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::uptime;

pub type SharedStats = Arc<RwLock<BatteryStats>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueFlags {
    pub over_current_discharge: bool,
    pub over_current_charge: bool,
    pub under_temperature: bool,
    pub over_temperature: bool,
    pub under_voltage: bool,
    pub over_voltage: bool,
    pub bms_internal: bool,
}

#[derive(Debug, Default)]
pub struct BatteryStats {
    manufacturer: Option<String>,

    last_update: u32,

    soc: f32,
    soc_precision: u8,
    last_update_soc: u32,

    voltage: f32,
    last_update_voltage: u32,

    /// Positive while charging, negative while discharging.
    current: f32,
    current_precision: u8,
    last_update_current: u32,

    discharge_current_limit: f32,
    last_update_discharge_current_limit: u32,

    charge_voltage: Option<f32>,
    charge_current_limit: Option<f32>,
    state_of_health: Option<f32>,
    temperature: Option<f32>,
    module_count: Option<u8>,

    charge_enabled: bool,
    discharge_enabled: bool,
    charge_immediately: bool,

    alarms: IssueFlags,
    warnings: IssueFlags,
}

impl BatteryStats {
    pub fn new_shared() -> SharedStats {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn set_manufacturer(&mut self, manufacturer: &str) {
        // strip control characters and anything non-ASCII
        let sanitized: String = manufacturer
            .chars()
            .take_while(|c| (' '..'\u{7f}').contains(c))
            .collect();
        self.manufacturer = Some(sanitized);
    }

    /// Age of the newest stat of any kind, in seconds.
    pub fn age_seconds(&self) -> u32 {
        uptime::age_seconds(self.last_update)
    }

    /// Whether any stat changed at or after `since` (wrap-safe).
    pub fn update_available(&self, since: u32) -> bool {
        if self.last_update == 0 {
            return false;
        }
        uptime::at_or_after(self.last_update, since)
    }

    pub fn soc(&self) -> f32 {
        self.soc
    }

    pub fn soc_precision(&self) -> u8 {
        self.soc_precision
    }

    pub fn soc_age_seconds(&self) -> u32 {
        uptime::age_seconds(self.last_update_soc)
    }

    pub fn is_soc_valid(&self) -> bool {
        self.last_update_soc > 0
    }

    pub fn set_soc(&mut self, soc: f32, precision: u8, timestamp: u32) {
        self.soc = soc;
        self.soc_precision = precision;
        self.last_update_soc = timestamp;
        self.last_update = timestamp;
    }

    pub fn voltage(&self) -> f32 {
        self.voltage
    }

    pub fn voltage_age_seconds(&self) -> u32 {
        uptime::age_seconds(self.last_update_voltage)
    }

    pub fn is_voltage_valid(&self) -> bool {
        self.last_update_voltage > 0
    }

    pub fn set_voltage(&mut self, voltage: f32, timestamp: u32) {
        self.voltage = voltage;
        self.last_update_voltage = timestamp;
        self.last_update = timestamp;
    }

    pub fn charge_current(&self) -> f32 {
        self.current
    }

    pub fn is_current_valid(&self) -> bool {
        self.last_update_current > 0
    }

    pub fn set_current(&mut self, current: f32, precision: u8, timestamp: u32) {
        self.current = current;
        self.current_precision = precision;
        self.last_update_current = timestamp;
        self.last_update = timestamp;
    }

    pub fn discharge_current_limit(&self) -> f32 {
        self.discharge_current_limit
    }

    pub fn discharge_current_limit_age_seconds(&self) -> u32 {
        uptime::age_seconds(self.last_update_discharge_current_limit)
    }

    pub fn is_discharge_current_limit_valid(&self) -> bool {
        self.last_update_discharge_current_limit > 0
    }

    pub fn set_discharge_current_limit(&mut self, limit: f32, timestamp: u32) {
        self.discharge_current_limit = limit;
        self.last_update_discharge_current_limit = timestamp;
        self.last_update = timestamp;
    }

    /// Maximum charge current granted by the BMS; unbounded if unknown.
    pub fn charge_current_limit(&self) -> f32 {
        self.charge_current_limit.unwrap_or(f32::MAX)
    }

    pub fn set_charge_current_limit(&mut self, limit: f32, timestamp: u32) {
        self.charge_current_limit = Some(limit);
        self.last_update = timestamp;
    }

    pub fn charge_voltage(&self) -> Option<f32> {
        self.charge_voltage
    }

    pub fn set_charge_voltage(&mut self, voltage: f32, timestamp: u32) {
        self.charge_voltage = Some(voltage);
        self.last_update = timestamp;
    }

    pub fn state_of_health(&self) -> Option<f32> {
        self.state_of_health
    }

    pub fn set_state_of_health(&mut self, soh: f32, timestamp: u32) {
        self.state_of_health = Some(soh);
        self.last_update = timestamp;
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f32, timestamp: u32) {
        self.temperature = Some(temperature);
        self.last_update = timestamp;
    }

    pub fn module_count(&self) -> Option<u8> {
        self.module_count
    }

    pub fn set_module_count(&mut self, count: u8) {
        self.module_count = Some(count);
    }

    pub fn charge_enabled(&self) -> bool {
        self.charge_enabled
    }

    pub fn discharge_enabled(&self) -> bool {
        self.discharge_enabled
    }

    pub fn set_charge_flags(&mut self, charge: bool, discharge: bool, immediately: bool, timestamp: u32) {
        self.charge_enabled = charge;
        self.discharge_enabled = discharge;
        self.charge_immediately = immediately;
        self.last_update = timestamp;
    }

    /// True while the battery is critically low and requests charging to
    /// prevent degradation. Drives the grid charger's emergency charge.
    pub fn immediate_charging_request(&self) -> bool {
        self.charge_immediately
    }

    pub fn alarms(&self) -> IssueFlags {
        self.alarms
    }

    pub fn warnings(&self) -> IssueFlags {
        self.warnings
    }

    pub fn set_issues(&mut self, alarms: IssueFlags, warnings: IssueFlags, timestamp: u32) {
        self.alarms = alarms;
        self.warnings = warnings;
        self.last_update = timestamp;
    }
}
