//! Dynamic power limiter.
//!
//! Closed-loop controller deciding, every few hundred milliseconds, what
//! every governed inverter shall produce so that the house grid import
//! tracks the configured target, honoring battery state, solar
//! availability, per-device limits and the grid charger.
//!
//! Each tick runs a strict sequence: status guards, configuration reload,
//! the battery discharge gate, class allocation (solar first, then
//! smart-buffer, then battery) and command dispatch.

pub mod handle;
pub mod inverter;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::battery::Battery;
use crate::config::{Config, InverterPowerSource, PowerLimiterConfig};
use crate::gridcharger::GridCharger;
use crate::mqtt::MqttService;
use crate::powermeter::GridMeter;
use crate::solarcharger::SolarCharger;
use crate::sun::SunPosition;
use crate::uptime;
use handle::InverterRegistry;
use inverter::PowerLimiterInverter;

/// Backoff between calculations while the system is stable; doubles up to
/// the cap, resets on any change.
const CALCULATION_BACKOFF_DEFAULT_MILLIS: u32 = 200;
const CALCULATION_BACKOFF_MAX_MILLIS: u32 = 1024;

/// Battery stats older than this must not steer the discharge gate.
const BATTERY_STATS_FRESHNESS_SECONDS: u32 = 60;

/// Networked meter readers may deliver a reading this late.
const POWER_METER_LAG_MILLIS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initializing,
    DisabledByConfig,
    DisabledByMqtt,
    WaitingForValidTimestamp,
    PowerMeterPending,
    InverterInvalid,
    InverterCmdPending,
    ConfigReload,
    InverterStatsPending,
    UnconditionalSolarPassthrough,
    Stable,
}

impl Status {
    pub fn text(self) -> &'static str {
        match self {
            Status::Initializing => "initializing (should not see me)",
            Status::DisabledByConfig => "disabled by configuration",
            Status::DisabledByMqtt => "disabled by MQTT",
            Status::WaitingForValidTimestamp => "waiting for valid date and time to be available",
            Status::PowerMeterPending => "waiting for sufficiently recent power meter reading",
            Status::InverterInvalid => "invalid inverter selection/configuration",
            Status::InverterCmdPending => {
                "waiting for a start/stop/restart/limit command to complete"
            }
            Status::ConfigReload => "reloading power limiter configuration",
            Status::InverterStatsPending => "waiting for sufficiently recent inverter data",
            Status::UnconditionalSolarPassthrough => {
                "unconditionally passing through all solar power (MQTT override)"
            }
            Status::Stable => "the system is stable, the last power limit is still valid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum Mode {
    Normal = 0,
    Disabled = 1,
    UnconditionalFullSolarPassthrough = 2,
}

/// Summary for operator surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    Inactive,
    Charging,
    UseSolarOnly,
    UseSolarAndBattery,
}

struct Inner {
    inverters: Vec<PowerLimiterInverter>,
    retirees: Vec<PowerLimiterInverter>,

    battery_discharge_enabled: bool,
    nighttime_discharging: bool,
    full_solar_passthrough: bool,

    next_inverter_restart: Option<u32>,

    last_calculation: u32,
    calculation_backoff: u32,

    last_status: Status,
    last_status_announced: u32,

    /// Memoized once per tick.
    load_corrected_voltage: Option<f32>,

    last_expected_output: u16,
}

pub struct PowerLimiter {
    config: Arc<parking_lot::RwLock<Config>>,
    mqtt: Arc<MqttService>,
    battery: Arc<dyn Battery>,
    solar_charger: Arc<dyn SolarCharger>,
    power_meter: Arc<dyn GridMeter>,
    grid_charger: Arc<dyn GridCharger>,
    registry: Arc<dyn InverterRegistry>,
    sun: SunPosition,
    producing_tx: watch::Sender<bool>,

    inner: tokio::sync::Mutex<Inner>,
    mode: AtomicU8,
    reload_pending: AtomicBool,
}

impl PowerLimiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<parking_lot::RwLock<Config>>,
        mqtt: Arc<MqttService>,
        battery: Arc<dyn Battery>,
        solar_charger: Arc<dyn SolarCharger>,
        power_meter: Arc<dyn GridMeter>,
        grid_charger: Arc<dyn GridCharger>,
        registry: Arc<dyn InverterRegistry>,
        sun: SunPosition,
        producing_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            mqtt,
            battery,
            solar_charger,
            power_meter,
            grid_charger,
            registry,
            sun,
            producing_tx,
            inner: tokio::sync::Mutex::new(Inner {
                inverters: Vec::new(),
                retirees: Vec::new(),
                battery_discharge_enabled: false,
                nighttime_discharging: false,
                full_solar_passthrough: false,
                next_inverter_restart: None,
                last_calculation: 0,
                calculation_backoff: 0,
                last_status: Status::Initializing,
                last_status_announced: 0,
                load_corrected_voltage: None,
                last_expected_output: 0,
            }),
            mode: AtomicU8::new(Mode::Normal as u8),
            reload_pending: AtomicBool::new(true),
        }
    }

    pub fn mode(&self) -> Mode {
        Mode::from_repr(self.mode.load(Ordering::Relaxed)).unwrap_or(Mode::Normal)
    }

    pub fn set_mode(&self, mode: Mode) {
        let previous = self.mode.swap(mode as u8, Ordering::Relaxed);
        if previous != mode as u8 {
            info!(?mode, "power limiter mode changed");
            self.trigger_reload();
        }
    }

    /// Request the inverter set to be rebuilt from the current
    /// configuration at the next tick.
    pub fn trigger_reload(&self) {
        self.reload_pending.store(true, Ordering::Relaxed);
    }

    pub async fn status(&self) -> Status {
        self.inner.lock().await.last_status
    }

    /// Sum of command timeouts across all governed inverters.
    pub async fn inverter_update_timeouts(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner
            .inverters
            .iter()
            .map(|inv| inv.update_timeouts() as u32)
            .sum()
    }

    pub async fn ui_state(&self) -> UiState {
        let inner = self.inner.lock().await;

        let mut reachable = false;
        let mut producing = false;
        for inv in &inner.inverters {
            reachable |= inv.is_reachable();
            producing |= inv.is_producing();
        }

        if !reachable {
            return UiState::Inactive;
        }
        if !producing {
            return UiState::Charging;
        }
        if inner.battery_discharge_enabled {
            UiState::UseSolarAndBattery
        } else {
            UiState::UseSolarOnly
        }
    }

    /// Subscribe the runtime mode override.
    pub async fn subscribe_commands(self: &Arc<Self>) {
        let prefix = self.mqtt.prefix().to_string();
        let limiter = Arc::downgrade(self);

        self.mqtt
            .subscribe(
                &format!("{prefix}powerlimiter/cmd/mode"),
                Arc::new(move |topic, payload| {
                    let Some(limiter) = limiter.upgrade() else { return };
                    match crate::mqtt::numeric_from_payload(payload, None) {
                        Ok(raw) => match Mode::from_repr(raw as u8) {
                            Some(mode) => limiter.set_mode(mode),
                            None => warn!(topic, raw, "unknown power limiter mode"),
                        },
                        Err(e) => warn!(topic, error = %e, "ignoring mode command"),
                    }
                }),
            )
            .await;
    }

    pub async fn tick(&self) {
        let mut inner = self.inner.lock().await;
        let config = self.config.read().clone();

        let producing = inner
            .inverters
            .iter()
            .any(|inv| inv.is_battery_powered() && inv.is_producing());
        self.producing_tx.send_replace(producing);

        // commands to inverters require valid time information; the radio
        // stack refuses to send until then, so not even a shutdown would
        // get through
        if !uptime::wall_clock_valid() {
            return self.announce(&mut inner, Status::WaitingForValidTimestamp).await;
        }

        // take care that the last requested power limits and power states
        // are actually reached before calculating new ones
        if Self::update_inverters(&mut inner) {
            return self.announce(&mut inner, Status::InverterCmdPending).await;
        }

        if self.reload_pending.swap(false, Ordering::Relaxed) {
            self.reload_config(&mut inner, &config);
            return self.announce(&mut inner, Status::ConfigReload).await;
        }

        if !config.power_limiter.enabled {
            return self.announce(&mut inner, Status::DisabledByConfig).await;
        }

        if self.mode() == Mode::Disabled {
            return self.announce(&mut inner, Status::DisabledByMqtt).await;
        }

        if inner.inverters.is_empty() {
            return self.announce(&mut inner, Status::InverterInvalid).await;
        }

        let mut latest_inverter_stats: u32 = 0;
        let mut stats_pending = false;
        for inv in inner.inverters.iter_mut() {
            let Some(stats_millis) = inv.latest_stats_millis() else {
                stats_pending = true;
                break;
            };
            if latest_inverter_stats == 0
                || uptime::at_or_after(stats_millis, latest_inverter_stats)
            {
                latest_inverter_stats = stats_millis;
            }
        }
        if stats_pending {
            return self.announce(&mut inner, Status::InverterStatsPending).await;
        }

        // only now do we know that all inverter stats are more recent than
        // their respective last update command
        if self.mode() == Mode::UnconditionalFullSolarPassthrough {
            return self
                .unconditional_full_solar_passthrough(&mut inner, &config)
                .await;
        }

        // if the power meter is in use, wait for a reading taken after the
        // inverters reached their last commanded state, plus network lag
        if self.power_meter.is_data_valid().await {
            let meter_update = self.power_meter.last_update().await;
            let threshold = latest_inverter_stats.wrapping_add(POWER_METER_LAG_MILLIS);
            if !uptime::at_or_after(meter_update, threshold) || meter_update == threshold {
                return self.announce(&mut inner, Status::PowerMeterPending).await;
            }
        }

        let now = uptime::millis();
        if uptime::elapsed(now, inner.last_calculation) < inner.calculation_backoff {
            return self.announce(&mut inner, Status::Stable).await;
        }

        self.auto_restart_inverters(&mut inner, &config, now);

        inner.battery_discharge_enabled = self.battery_discharge_gate(&mut inner, &config).await;

        // re-calculate the load-corrected voltage once per tick
        inner.load_corrected_voltage = None;

        let target = self.calc_target_output(&inner, &config).await;
        let target = target.min(config.power_limiter.total_upper_power_limit);

        let covered_solar =
            self.update_inverter_limits(&mut inner, target, InverterPowerSource::Solar, &config);
        let remaining_after_solar = target.saturating_sub(covered_solar);

        let covered_smart_buffer = self.update_inverter_limits(
            &mut inner,
            remaining_after_solar,
            InverterPowerSource::SmartBuffer,
            &config,
        );
        let remaining_after_smart_buffer =
            remaining_after_solar.saturating_sub(covered_smart_buffer);

        let bus_usage = self
            .calc_power_bus_usage(&mut inner, remaining_after_smart_buffer, &config)
            .await;
        let covered_battery = self.update_inverter_limits(
            &mut inner,
            bus_usage,
            InverterPowerSource::Battery,
            &config,
        );

        inner.last_expected_output = covered_solar + covered_smart_buffer + covered_battery;
        debug!(
            target,
            covered_solar, covered_smart_buffer, covered_battery, "allocation complete"
        );

        let limit_updated = Self::update_inverters(&mut inner);
        inner.last_calculation = uptime::millis();

        if !limit_updated {
            // the system seems stable, back off
            inner.calculation_backoff =
                CALCULATION_BACKOFF_MAX_MILLIS.min(inner.calculation_backoff.max(1) * 2);
            return self.announce(&mut inner, Status::Stable).await;
        }

        inner.calculation_backoff = CALCULATION_BACKOFF_DEFAULT_MILLIS;
    }

    /// Expected total output after the last allocation round.
    pub async fn last_expected_output(&self) -> u16 {
        self.inner.lock().await.last_expected_output
    }

    async fn announce(&self, inner: &mut Inner, status: Status) {
        let now = uptime::millis();

        // repeat the same status with a fixed interval at most; the
        // disabled-by-config status is announced exactly once
        if inner.last_status == status {
            if status == Status::DisabledByConfig {
                return;
            }
            if uptime::elapsed(now, inner.last_status_announced) < 10 * 1000 {
                return;
            }
        }

        info!("[DPL] {}", status.text());
        self.mqtt
            .publish("powerlimiter/status", status.text().to_string())
            .await;

        inner.last_status = status;
        inner.last_status_announced = now;
    }

    fn update_inverters(inner: &mut Inner) -> bool {
        let mut busy = false;

        for inv in inner.inverters.iter_mut() {
            if inv.update() {
                busy = true;
            }
        }

        inner.retirees.retain_mut(|inv| {
            let pending = inv.retire();
            busy |= pending;
            pending
        });

        busy
    }

    /// Rebuild the governed inverter set. Inverters that are no longer
    /// governed are retired, not dropped, so their last command completes
    /// and they cleanly enter standby.
    fn reload_config(&self, inner: &mut Inner, config: &Config) {
        let limiter_config = &config.power_limiter;

        if !limiter_config.enabled || self.mode() == Mode::Disabled {
            let retired: Vec<_> = inner.inverters.drain(..).collect();
            inner.retirees.extend(retired);
            return;
        }

        for inv in inner.inverters.drain(..).collect::<Vec<_>>() {
            let still_governed = limiter_config
                .inverters
                .iter()
                .any(|cfg| cfg.serial == inv.serial() && cfg.is_governed);
            if !still_governed {
                inner.retirees.push(inv);
            }
        }

        for inv_config in &limiter_config.inverters {
            if !inv_config.is_governed {
                continue;
            }
            if let Some(inv) =
                PowerLimiterInverter::create(inv_config.clone(), self.registry.as_ref())
            {
                inner.inverters.push(inv);
            }
        }

        self.calc_next_inverter_restart(inner, limiter_config);
    }

    fn auto_restart_inverters(&self, inner: &mut Inner, config: &Config, now: u32) {
        let Some(restart_at) = inner.next_inverter_restart else {
            return;
        };

        if !uptime::at_or_after(now, restart_at) {
            return;
        }

        for inv in inner.inverters.iter_mut() {
            if !inv.is_solar_powered() {
                info!(
                    serial = format_args!("{:016X}", inv.serial()),
                    "sending restart command"
                );
                inv.restart();
            }
        }

        self.calc_next_inverter_restart(inner, &config.power_limiter);
    }

    fn calc_next_inverter_restart(&self, inner: &mut Inner, config: &PowerLimiterConfig) {
        use chrono::Timelike;

        if config.restart_hour < 0 {
            inner.next_inverter_restart = None;
            info!("automatic inverter restart disabled");
            return;
        }

        let local = chrono::Local::now();
        let offset = restart_offset_minutes(config.restart_hour as u32, local.hour(), local.minute());

        debug!(offset_minutes = offset, "next inverter restart scheduled");
        inner.next_inverter_restart = Some(uptime::millis().wrapping_add(offset * 60_000));
    }

    async fn battery_discharge_gate(&self, inner: &mut Inner, config: &Config) -> bool {
        if !Self::uses_battery_powered_inverter(inner) {
            return false;
        }

        let is_day = self.sun.is_day_period();

        // a nighttime discharge cycle ends at sunrise; past that point the
        // regular start threshold governs again
        if inner.nighttime_discharging && is_day {
            inner.nighttime_discharging = false;
            return self.is_start_threshold_reached(inner, config).await;
        }

        if self.is_stop_threshold_reached(inner, config).await {
            return false;
        }

        if self.is_start_threshold_reached(inner, config).await {
            return true;
        }

        // discharge a partially charged battery at night, once per night
        if config.power_limiter.battery_always_use_at_night
            && !is_day
            && !inner.battery_discharge_enabled
            && !inner.nighttime_discharging
        {
            inner.nighttime_discharging = true;
            return true;
        }

        // between the start and stop thresholds: keep whatever was last
        // decided (hysteresis)
        inner.battery_discharge_enabled
    }

    async fn test_threshold(
        &self,
        inner: &mut Inner,
        config: &Config,
        soc_threshold: f32,
        voltage_threshold: f32,
        compare: fn(f32, f32) -> bool,
    ) -> bool {
        // prefer the SoC from the battery interface, unless the user opted
        // out or the data is stale
        let stats = self.battery.stats().await;
        {
            let stats = stats.read();
            if !config.power_limiter.ignore_soc
                && config.battery.enabled
                && soc_threshold > 0.0
                && stats.is_soc_valid()
                && stats.soc_age_seconds() < BATTERY_STATS_FRESHNESS_SECONDS
            {
                return compare(stats.soc(), soc_threshold);
            }
        }

        if voltage_threshold <= 0.0 {
            return false;
        }

        compare(
            self.load_corrected_voltage(inner, config).await,
            voltage_threshold,
        )
    }

    async fn is_start_threshold_reached(&self, inner: &mut Inner, config: &Config) -> bool {
        self.test_threshold(
            inner,
            config,
            config.power_limiter.battery_soc_start_threshold,
            config.power_limiter.voltage_start_threshold,
            |value, threshold| value >= threshold,
        )
        .await
    }

    async fn is_stop_threshold_reached(&self, inner: &mut Inner, config: &Config) -> bool {
        self.test_threshold(
            inner,
            config,
            config.power_limiter.battery_soc_stop_threshold,
            config.power_limiter.voltage_stop_threshold,
            |value, threshold| value <= threshold,
        )
        .await
    }

    async fn is_below_stop_threshold(&self, inner: &mut Inner, config: &Config) -> bool {
        self.test_threshold(
            inner,
            config,
            config.power_limiter.battery_soc_stop_threshold,
            config.power_limiter.voltage_stop_threshold,
            |value, threshold| value < threshold,
        )
        .await
    }

    /// Battery voltage, trying multiple sources: the BMS wins, then the
    /// charge controller output, then the configured inverter's DC input.
    async fn battery_voltage(&self, inner: &Inner, config: &Config) -> f32 {
        let mut result = 0.0;

        if let Some(voltage) = Self::inverter_dc_voltage(inner, config) {
            if voltage > 0.0 {
                result = voltage;
            }
        }

        if let Some(voltage) = self.solar_charger.stats().await.output_voltage() {
            result = voltage;
        }

        let stats = self.battery.stats().await;
        let stats = stats.read();
        if config.battery.enabled
            && stats.is_voltage_valid()
            && stats.voltage_age_seconds() < BATTERY_STATS_FRESHNESS_SECONDS
        {
            result = stats.voltage();
        }

        result
    }

    fn inverter_dc_voltage(inner: &Inner, config: &Config) -> Option<f32> {
        let serial = config.power_limiter.inverter_serial_for_dc_voltage;
        let channel = config.power_limiter.inverter_channel_for_dc_voltage;

        inner
            .inverters
            .iter()
            .find(|inv| inv.serial() == serial)
            .and_then(|inv| inv.dc_voltage(channel))
    }

    async fn load_corrected_voltage(&self, inner: &mut Inner, config: &Config) -> f32 {
        if let Some(voltage) = inner.load_corrected_voltage {
            return voltage;
        }

        let ac_power = Self::battery_inverters_output_ac_watts(inner);
        let dc_voltage = self.battery_voltage(inner, config).await;

        if dc_voltage <= 0.0 {
            return 0.0;
        }

        let corrected =
            dc_voltage + ac_power * config.power_limiter.voltage_load_correction_factor;
        inner.load_corrected_voltage = Some(corrected);
        corrected
    }

    fn battery_inverters_output_ac_watts(inner: &Inner) -> f32 {
        inner
            .inverters
            .iter()
            .filter(|inv| inv.is_battery_powered())
            .map(|inv| inv.current_output_ac_watts() as f32)
            .sum()
    }

    fn uses_battery_powered_inverter(inner: &Inner) -> bool {
        inner.inverters.iter().any(|inv| inv.is_battery_powered())
    }

    /// AC output power to plan with for the given DC power, accounting for
    /// conduction losses and a conservative fixed conversion efficiency.
    /// The actual efficiency is only known after the fact.
    fn dc_power_bus_to_inverter_ac(dc_power: u16, config: &Config) -> u16 {
        let losses_factor = 1.0 - config.power_limiter.conduction_losses as f32 / 100.0;
        (0.95 * losses_factor * dc_power as f32) as u16
    }

    /// Desired total output of all eligible inverters: whatever they produce
    /// right now plus the difference between target consumption and the
    /// meter reading.
    async fn calc_target_output(&self, inner: &Inner, config: &Config) -> u16 {
        let target_consumption = config.power_limiter.target_power_consumption;
        let base_load = config.power_limiter.base_load_limit;

        if !self.power_meter.is_data_valid().await {
            return base_load;
        }

        let meter_value = self.power_meter.power_total().await;
        let mut corrected_meter_value = meter_value.round() as i32;

        // inverters feeding in between the billing meter and our power
        // meter are registered as consumption; deduct their production to
        // derive the billing meter's reading
        let is_day = self.sun.is_day_period();
        for inv in &inner.inverters {
            if inv.is_behind_power_meter() {
                continue;
            }

            // solar-powered inverters are expected to be unreachable during
            // the night and produce nothing then; in every other case,
            // assume unreachable inverters still produce what they last
            // reported, as overestimating production is the safe direction
            if inv.is_solar_powered() && !inv.is_reachable() && !is_day {
                continue;
            }

            corrected_meter_value -= inv.current_output_ac_watts() as i32;
        }

        let mut current_total_output: i32 = 0;
        for inv in &inner.inverters {
            // non-eligible inverters do not participate in this round at
            // all; inverters in standby report 0 W output
            if !inv.is_eligible() {
                continue;
            }
            current_total_output += inv.current_output_ac_watts() as i32;
        }

        let target = current_total_output + corrected_meter_value - target_consumption;

        // already exporting more than the (possibly negative) target
        // consumption allows: produce nothing
        if target < 0 {
            return 0;
        }

        target.min(u16::MAX as i32) as u16
    }

    /// Assign new limits to all eligible inverters of one class. Returns
    /// the total power these inverters are expected to produce afterwards.
    fn update_inverter_limits(
        &self,
        inner: &mut Inner,
        power_requested: u16,
        source: InverterPowerSource,
        config: &Config,
    ) -> u16 {
        let hysteresis = config.power_limiter.target_power_consumption_hysteresis;

        let mut matching: Vec<&mut PowerLimiterInverter> = inner
            .inverters
            .iter_mut()
            .filter(|inv| inv.power_source() == source && inv.is_eligible())
            .collect();

        if matching.is_empty() {
            return 0;
        }

        let producing: u16 = matching
            .iter()
            .map(|inv| inv.current_output_ac_watts())
            .sum();

        let diff = power_requested as i32 - producing as i32;

        debug!(
            ?source,
            power_requested, producing, diff, hysteresis, "updating class limits"
        );

        if diff.unsigned_abs() < hysteresis as u32 {
            return producing;
        }

        let mut covered: u16 = 0;

        if diff < 0 {
            let mut reduction = diff.unsigned_abs() as u16;

            let total_max_reduction: u16 = matching
                .iter()
                .map(|inv| inv.max_reduction_watts(false))
                .sum();

            // putting at least one inverter into standby is only on the
            // table if reductions alone cannot cover the request
            let allow_standby = total_max_reduction < reduction;

            matching.sort_by(|a, b| {
                b.max_reduction_watts(allow_standby)
                    .cmp(&a.max_reduction_watts(allow_standby))
            });

            for inv in matching {
                let max_reduction = inv.max_reduction_watts(allow_standby);
                if reduction >= hysteresis && max_reduction >= hysteresis {
                    reduction =
                        reduction.saturating_sub(inv.apply_reduction(reduction, allow_standby));
                }
                covered += inv.expected_output_ac_watts();
            }
        } else {
            let mut increase = diff as u16;

            matching.sort_by(|a, b| b.max_increase_watts().cmp(&a.max_increase_watts()));

            for inv in matching {
                let max_increase = inv.max_increase_watts();
                if increase >= hysteresis && max_increase >= hysteresis {
                    increase = increase.saturating_sub(inv.apply_increase(increase));
                }
                covered += inv.expected_output_ac_watts();
            }
        }

        covered
    }

    /// How much power the battery-powered inverters may draw from the power
    /// bus: the part of the circuitry fed by the charge controllers, the
    /// grid charger and the battery.
    async fn calc_power_bus_usage(
        &self,
        inner: &mut Inner,
        power_requested: u16,
        config: &Config,
    ) -> u16 {
        let full_passthrough = self.is_full_solar_passthrough_active(inner, config).await;

        // while the grid charger drives the bus, battery-powered inverters
        // stay off it; the charger shall reduce or shut down first. Full
        // solar passthrough is the exception: producing inverters make the
        // charger shut down as a consequence.
        if !full_passthrough && self.grid_charger.auto_power_status().await {
            debug!("power bus usage blocked by grid charger auto power");
            return 0;
        }

        let solar_output_dc = self.solar_passthrough_power(inner, config).await;
        let solar_output_ac = Self::dc_power_bus_to_inverter_ac(solar_output_dc, config);

        if full_passthrough && solar_output_ac > power_requested {
            debug!(solar_output_dc, solar_output_ac, "full solar passthrough");
            return solar_output_ac;
        }

        let Some(discharge_limit) = self.battery_discharge_limit(inner, config).await else {
            debug!(power_requested, "no battery discharge limit, granting request");
            return power_requested;
        };

        let battery_allowance_ac = Self::dc_power_bus_to_inverter_ac(discharge_limit, config);

        debug!(
            discharge_limit,
            battery_allowance_ac, solar_output_ac, power_requested, "power bus allowance"
        );

        power_requested.min(battery_allowance_ac + solar_output_ac)
    }

    /// Effective cap on DC power drawn from the battery; `None` if
    /// unbounded.
    async fn battery_discharge_limit(&self, inner: &Inner, config: &Config) -> Option<u16> {
        if !inner.battery_discharge_enabled {
            return Some(0);
        }

        let current_limit = self.battery.discharge_current_limit().await;
        if current_limit == f32::MAX {
            return None;
        }
        let current_limit = current_limit.abs();

        // the voltage sags between battery and inverter; since the inverter
        // power is what gets regulated, its voltage is the right one
        let Some(voltage) = Self::inverter_dc_voltage(inner, config).filter(|v| *v > 0.0) else {
            warn!("could not determine inverter voltage");
            return Some(0);
        };

        Some((voltage * current_limit) as u16)
    }

    async fn solar_passthrough_power(&self, inner: &mut Inner, config: &Config) -> u16 {
        let output = self.solar_charger.stats().await.output_power_watts();

        if !Self::is_solar_passthrough_enabled(inner, config)
            || self.is_below_stop_threshold(inner, config).await
        {
            return 0;
        }

        match output {
            Some(watts) => watts.max(0.0) as u16,
            None => 0,
        }
    }

    fn is_solar_passthrough_enabled(inner: &Inner, config: &Config) -> bool {
        // only meaningful with battery-powered inverters and a charge
        // controller between panels and battery
        Self::uses_battery_powered_inverter(inner)
            && config.solar_charger.enabled
            && config.power_limiter.solar_passthrough_enabled
    }

    async fn is_full_solar_passthrough_active(&self, inner: &mut Inner, config: &Config) -> bool {
        if !Self::is_solar_passthrough_enabled(inner, config) {
            return false;
        }

        if self
            .test_threshold(
                inner,
                config,
                config.power_limiter.full_solar_passthrough_soc,
                config.power_limiter.full_solar_passthrough_start_voltage,
                |value, threshold| value >= threshold,
            )
            .await
        {
            inner.full_solar_passthrough = true;
        }

        if self
            .test_threshold(
                inner,
                config,
                config.power_limiter.full_solar_passthrough_soc,
                config.power_limiter.full_solar_passthrough_stop_voltage,
                |value, threshold| value < threshold,
            )
            .await
        {
            inner.full_solar_passthrough = false;
        }

        inner.full_solar_passthrough
    }

    /// Inverters behave as if they were wired to the panels directly: all
    /// solar power, and only solar power, is converted to AC, independent
    /// of the meter.
    async fn unconditional_full_solar_passthrough(&self, inner: &mut Inner, config: &Config) {
        let now = uptime::millis();
        if uptime::elapsed(now, inner.last_calculation) < inner.calculation_backoff {
            return;
        }
        inner.last_calculation = now;

        for inv in inner.inverters.iter_mut() {
            if !inv.is_battery_powered() {
                inv.set_max_output();
            }
        }

        let mut target_output = 0u16;
        if let Some(watts) = self.solar_charger.stats().await.output_power_watts() {
            target_output = Self::dc_power_bus_to_inverter_ac(watts.max(0.0) as u16, config);
        }

        inner.calculation_backoff = 1000;
        self.update_inverter_limits(inner, target_output, InverterPowerSource::Battery, config);
        self.announce(inner, Status::UnconditionalSolarPassthrough).await;
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => limiter.tick().await,
                }
            }
        });
    }
}

/// Minutes until the next daily restart at `restart_hour`, from the current
/// local time. Handles the cross-midnight case.
fn restart_offset_minutes(restart_hour: u32, current_hour: u32, current_minute: u32) -> u32 {
    let day_minutes = current_hour * 60 + current_minute;
    let target_minutes = restart_hour * 60;

    if restart_hour > current_hour {
        target_minutes - day_minutes
    } else {
        1440 - day_minutes + target_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(14, 12, 0, 120)] // later today
    #[case(14, 12, 30, 90)]
    #[case(3, 23, 30, 210)] // cross-midnight
    #[case(12, 12, 0, 1440)] // same hour: next day
    #[case(0, 10, 0, 840)] // midnight restart
    fn restart_offsets(
        #[case] restart_hour: u32,
        #[case] hour: u32,
        #[case] minute: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(restart_offset_minutes(restart_hour, hour, minute), expected);
    }

    #[test]
    fn status_texts_are_distinct() {
        let statuses = [
            Status::Initializing,
            Status::DisabledByConfig,
            Status::DisabledByMqtt,
            Status::WaitingForValidTimestamp,
            Status::PowerMeterPending,
            Status::InverterInvalid,
            Status::InverterCmdPending,
            Status::ConfigReload,
            Status::InverterStatsPending,
            Status::UnconditionalSolarPassthrough,
            Status::Stable,
        ];

        for (i, a) in statuses.iter().enumerate() {
            for b in statuses.iter().skip(i + 1) {
                assert_ne!(a.text(), b.text());
            }
        }
    }

    #[test]
    fn mode_round_trips_through_repr() {
        for mode in [Mode::Normal, Mode::Disabled, Mode::UnconditionalFullSolarPassthrough] {
            assert_eq!(Mode::from_repr(mode as u8), Some(mode));
        }
        assert_eq!(Mode::from_repr(7), None);
    }
}
