//! Grid charger (Huawei rectifier) control plane.
//!
//! Four modes: `Off`, `On`, `AutoExt` (an external loop drives the limits
//! through [`Controller::set_parameter`]) and `AutoInt` (this controller
//! steers the output current so the grid power meter tracks the configured
//! target consumption). An emergency charge request from the battery
//! overrides everything until it clears and the output current decayed.

pub mod hardware;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::battery::Battery;
use crate::config::Config;
use crate::hardware::factory::TransportFactory;
use crate::mqtt::{numeric_from_payload, MqttService};
use crate::powermeter::GridMeter;
use crate::uptime;
use hardware::{HardwareInterface, Setting, DATA_REQUEST_INTERVAL_MILLIS};

/// Output current below this threshold counts as "not charging"; after 60 s
/// the power stage is switched off so the fan can spin down first.
const SHUTDOWN_DELAY_MILLIS: u32 = 60 * 1000;
const SHUTDOWN_CURRENT_AMPS: f32 = 0.75;

/// Interval of the periodic voltage setpoint re-assertion.
const VOLTAGE_ASSERT_INTERVAL_MILLIS: u32 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum Mode {
    Off = 0,
    On = 1,
    AutoExt = 2,
    AutoInt = 3,
}

/// The slot-detect pin that powers the rectifier's control board.
pub trait PowerSwitch: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

#[derive(Default)]
pub struct SimulatedPowerSwitch {
    enabled: AtomicBool,
}

impl PowerSwitch for SimulatedPowerSwitch {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Decoded rectifier state. Each value carries its receive timestamp; the
/// aggregate `last_update` is the oldest one, so one stalled channel holds
/// the whole reading back.
#[derive(Debug, Clone, Copy, Default)]
pub struct RectifierParameters {
    pub input_voltage: f32,
    pub input_frequency: f32,
    pub input_current: f32,
    pub input_power: f32,
    pub input_temperature: f32,
    pub efficiency: f32,
    pub output_voltage: f32,
    pub output_current: f32,
    pub max_output_current: f32,
    pub output_power: f32,
    pub output_temperature: f32,
    pub last_update: u32,
}

impl RectifierParameters {
    fn from_data_points(data: &crate::datapoints::DataPointContainer<hardware::Label>) -> Self {
        let mut last_update = u32::MAX;

        fn fetch<T>(
            data: &crate::datapoints::DataPointContainer<hardware::Label>,
            last_update: &mut u32,
        ) -> f32
        where
            T: crate::datapoints::Typed<Set = hardware::Label, Value = f32>,
        {
            match data.data_point_for::<T>() {
                Some(point) => {
                    *last_update = (*last_update).min(point.timestamp());
                    data.get::<T>().unwrap_or(0.0)
                }
                None => {
                    *last_update = 0;
                    0.0
                }
            }
        }

        Self {
            input_voltage: fetch::<hardware::InputVoltage>(data, &mut last_update),
            input_frequency: fetch::<hardware::InputFrequency>(data, &mut last_update),
            input_current: fetch::<hardware::InputCurrent>(data, &mut last_update),
            input_power: fetch::<hardware::InputPower>(data, &mut last_update),
            input_temperature: fetch::<hardware::InputTemperature>(data, &mut last_update),
            efficiency: fetch::<hardware::Efficiency>(data, &mut last_update),
            output_voltage: fetch::<hardware::OutputVoltage>(data, &mut last_update),
            output_current: fetch::<hardware::OutputCurrent>(data, &mut last_update),
            max_output_current: fetch::<hardware::OutputCurrentMax>(data, &mut last_update),
            output_power: fetch::<hardware::OutputPower>(data, &mut last_update),
            output_temperature: fetch::<hardware::OutputTemperature>(data, &mut last_update),
            last_update,
        }
    }

    /// Efficiency with the defensive fallback for a missing or implausible
    /// reading. The rectifier reports a ratio in (0.5, 1).
    fn effective_efficiency(&self) -> f32 {
        if self.efficiency > 0.5 {
            self.efficiency
        } else {
            debug!(reported = self.efficiency, "rectifier efficiency implausible, assuming 1.0");
            1.0
        }
    }
}

/// Consumed by the power limiter to keep battery-powered inverters off the
/// bus while the charger is actively charging.
#[async_trait]
pub trait GridCharger: Send + Sync {
    async fn auto_power_status(&self) -> bool;
}

enum Command {
    Mode(u8),
    OnlineVoltage(f32),
    OfflineVoltage(f32),
    OnlineCurrent(f32),
    OfflineCurrent(f32),
    Power(bool),
}

pub struct Controller {
    config: Arc<parking_lot::RwLock<Config>>,
    mqtt: Arc<MqttService>,
    factory: Arc<TransportFactory>,
    battery: Arc<dyn Battery>,
    power_meter: Arc<dyn GridMeter>,
    inverter_producing: watch::Receiver<bool>,
    inner: tokio::sync::Mutex<Inner>,
    pending_commands: Arc<Mutex<Vec<Command>>>,
    last_publish: AtomicU32,
}

struct Inner {
    hardware: Option<HardwareInterface>,
    power_switch: Arc<dyn PowerSwitch>,
    mode: Mode,
    auto_power_enabled: bool,
    auto_power_enabled_counter: u8,
    emergency_charging: bool,
    output_current_on_since: u32,
    next_voltage_assert: u32,
    auto_mode_blocked_till: u32,
    last_power_meter_update: u32,
}

impl Controller {
    pub fn new(
        config: Arc<parking_lot::RwLock<Config>>,
        mqtt: Arc<MqttService>,
        factory: Arc<TransportFactory>,
        battery: Arc<dyn Battery>,
        power_meter: Arc<dyn GridMeter>,
        inverter_producing: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            mqtt,
            factory,
            battery,
            power_meter,
            inverter_producing,
            inner: tokio::sync::Mutex::new(Inner {
                hardware: None,
                power_switch: Arc::new(SimulatedPowerSwitch::default()),
                mode: Mode::Off,
                auto_power_enabled: false,
                auto_power_enabled_counter: 0,
                emergency_charging: false,
                output_current_on_since: 0,
                next_voltage_assert: 0,
                auto_mode_blocked_till: 0,
                last_power_meter_update: 0,
            }),
            pending_commands: Arc::new(Mutex::new(Vec::new())),
            last_publish: AtomicU32::new(0),
        }
    }

    pub async fn update_settings(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(old) = inner.hardware.take() {
            old.stop().await;
        }

        let charger_config = {
            let config = self.config.read();
            if !config.grid_charger.enabled {
                return;
            }
            config.grid_charger.clone()
        };

        let bus = self.factory.create_grid_charger_can_bus(charger_config.can_interface);
        let mut hardware = HardwareInterface::new(bus);
        hardware.start();
        inner.hardware = Some(hardware);

        inner.power_switch.set_enabled(false);

        if charger_config.auto_power_enabled {
            inner.mode = Mode::AutoInt;
        }

        info!(interface = ?charger_config.can_interface, "grid charger hardware interface ready");
    }

    pub async fn mode(&self) -> Mode {
        self.inner.lock().await.mode
    }

    pub async fn parameters(&self) -> Option<RectifierParameters> {
        let inner = self.inner.lock().await;
        inner
            .hardware
            .as_ref()
            .map(|hardware| RectifierParameters::from_data_points(&hardware.data_points()))
    }

    pub async fn is_output_enabled(&self) -> bool {
        self.inner.lock().await.power_switch.is_enabled()
    }

    /// External parameter write. Ignored in internal automatic mode, which
    /// owns the limits itself.
    pub async fn set_parameter(&self, setting: Setting, value: f32) {
        let mut inner = self.inner.lock().await;
        if inner.mode == Mode::AutoInt {
            return;
        }
        Self::set_parameter_locked(&mut inner, setting, value);
    }

    fn set_parameter_locked(inner: &mut Inner, setting: Setting, value: f32) {
        let Some(hardware) = inner.hardware.as_ref() else { return };

        if value < 0.0 {
            warn!(value, "refusing to set negative voltage/current");
            return;
        }

        // starting to charge in an automatic mode powers the PSU up
        if value > SHUTDOWN_CURRENT_AMPS
            && setting == Setting::OnlineCurrent
            && matches!(inner.mode, Mode::AutoExt | Mode::AutoInt)
        {
            inner.power_switch.set_enabled(true);
            inner.output_current_on_since = uptime::millis();
        }

        hardware.set_parameter(setting, value);
    }

    pub async fn set_mode(&self, mode: Mode) {
        let mut inner = self.inner.lock().await;

        if inner.hardware.is_none() {
            return;
        }

        match mode {
            Mode::Off => {
                inner.power_switch.set_enabled(false);
                inner.mode = Mode::Off;
            }
            Mode::On => {
                inner.power_switch.set_enabled(true);
                inner.mode = Mode::On;
            }
            Mode::AutoInt => {
                let auto_configured = self.config.read().grid_charger.auto_power_enabled;
                if !auto_configured {
                    warn!("ignoring switch to internal automatic power control: not configured");
                    return;
                }
                inner.mode = Mode::AutoInt;
            }
            Mode::AutoExt => {
                if inner.mode == Mode::AutoInt {
                    inner.auto_power_enabled = false;
                    Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, 0.0);
                }
                inner.mode = Mode::AutoExt;
            }
        }
    }

    pub async fn tick(&self) {
        self.drain_commands().await;

        let mut inner = self.inner.lock().await;
        let Some(hardware) = inner.hardware.as_ref() else { return };

        hardware.poke();
        let rp = RectifierParameters::from_data_points(&hardware.data_points());

        let (charger_config, battery_enabled) = {
            let config = self.config.read();
            (config.grid_charger.clone(), config.battery.enabled)
        };

        let now = uptime::millis();

        if rp.output_current > SHUTDOWN_CURRENT_AMPS {
            inner.output_current_on_since = now;
        }

        if uptime::elapsed(now, inner.output_current_on_since) > SHUTDOWN_DELAY_MILLIS
            && matches!(inner.mode, Mode::AutoExt | Mode::AutoInt)
        {
            inner.power_switch.set_enabled(false);
        }

        if (inner.mode == Mode::AutoInt || inner.emergency_charging)
            && uptime::at_or_after(now, inner.next_voltage_assert)
        {
            debug!(voltage = charger_config.voltage_limit, "re-asserting voltage limit");
            Self::set_parameter_locked(&mut inner, Setting::OnlineVoltage, charger_config.voltage_limit);
            inner.next_voltage_assert = now.wrapping_add(VOLTAGE_ASSERT_INTERVAL_MILLIS);
        }

        let stats = self.battery.stats().await;
        let (immediate_request, battery_soc, battery_current, charge_current_limit) = {
            let stats = stats.read();
            (
                stats.immediate_charging_request(),
                stats.soc(),
                stats.charge_current(),
                stats.charge_current_limit(),
            )
        };

        // emergency charge takes precedence over everything
        if charger_config.emergency_charge_enabled && immediate_request {
            inner.emergency_charging = true;

            let efficiency = rp.effective_efficiency();
            if rp.output_voltage <= 0.0 {
                return;
            }
            let output_current = efficiency * (charger_config.upper_power_limit / rp.output_voltage);
            info!(output_current, "emergency charge");
            Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, output_current);
            return;
        }

        if inner.emergency_charging && !immediate_request {
            // wind down; only re-arm normal control once the current decayed
            Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, 0.0);
            if rp.output_current < 1.0 {
                inner.emergency_charging = false;
            }
            return;
        }

        if inner.mode != Mode::AutoInt {
            drop(inner);
            self.publish_telemetry().await;
            return;
        }

        // a recently issued value needs time to stabilize before the next
        // calculation makes sense
        if !uptime::at_or_after(now, inner.auto_mode_blocked_till) {
            return;
        }

        if rp.output_voltage < charger_config.enable_voltage_limit {
            inner.auto_power_enabled_counter = 10;
        }

        if *self.inverter_producing.borrow() {
            debug!("battery-powered inverter is producing, suspending auto power");
            Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, 0.0);
            inner.auto_mode_blocked_till = now.wrapping_add(1000);
            return;
        }

        let meter_update = self.power_meter.last_update().await;
        let meter_is_newer = meter_update != inner.last_power_meter_update
            && uptime::at_or_after(meter_update, inner.last_power_meter_update);

        if meter_is_newer && inner.auto_power_enabled_counter > 0 {
            inner.last_power_meter_update = meter_update;

            let efficiency = rp.effective_efficiency();
            let meter_total = self.power_meter.power_total().await;

            // requested output power plus the permissible grid consumption,
            // adjusted for conversion losses
            let mut new_power_limit = -meter_total.round() + rp.output_power
                + charger_config.target_power_consumption / efficiency;

            if battery_enabled
                && charger_config.battery_soc_limits_enabled
                && battery_soc >= charger_config.stop_battery_soc_threshold
            {
                debug!(battery_soc, "battery SoC stop threshold reached");
                new_power_limit = 0.0;
            }

            if new_power_limit > charger_config.lower_power_limit {
                // ramping up from zero output is permitted through a counter
                // that also detects the battery refusing to take power
                if rp.output_power < charger_config.lower_power_limit {
                    inner.auto_power_enabled_counter -= 1;
                    if inner.auto_power_enabled_counter == 0 {
                        info!("output power below lower limit, disabling automatic power control");
                        inner.auto_power_enabled = false;
                        Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, 0.0);
                        return;
                    }
                } else {
                    inner.auto_power_enabled_counter = 10;
                }

                new_power_limit = new_power_limit.min(charger_config.upper_power_limit);

                let calculated_current = efficiency * new_power_limit / rp.output_voltage;

                // BMS limit minus what other sources already push into the
                // battery (e.g. the MPPT charge controllers)
                let permissible_current =
                    charge_current_limit - (battery_current - rp.output_current);

                let output_current = calculated_current.min(permissible_current).max(0.0);

                debug!(
                    output_current,
                    calculated_current, permissible_current, "steering output current"
                );

                inner.auto_power_enabled = true;
                Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, output_current);
                inner.auto_mode_blocked_till =
                    now.wrapping_add(2 * DATA_REQUEST_INTERVAL_MILLIS);
            } else {
                inner.auto_power_enabled = false;
                Self::set_parameter_locked(&mut inner, Setting::OnlineCurrent, 0.0);
            }
        }

        drop(inner);
        self.publish_telemetry().await;
    }

    async fn drain_commands(&self) {
        let commands: Vec<Command> = std::mem::take(&mut *self.pending_commands.lock());

        for command in commands {
            match command {
                Command::Mode(raw) => {
                    if let Some(mode) = Mode::from_repr(raw) {
                        self.set_mode(mode).await;
                    } else {
                        warn!(raw, "ignoring unknown grid charger mode");
                    }
                }
                Command::OnlineVoltage(value) => {
                    self.set_parameter(Setting::OnlineVoltage, value).await
                }
                Command::OfflineVoltage(value) => {
                    self.set_parameter(Setting::OfflineVoltage, value).await
                }
                Command::OnlineCurrent(value) => {
                    self.set_parameter(Setting::OnlineCurrent, value).await
                }
                Command::OfflineCurrent(value) => {
                    self.set_parameter(Setting::OfflineCurrent, value).await
                }
                Command::Power(on) => {
                    self.set_mode(if on { Mode::On } else { Mode::Off }).await
                }
            }
        }
    }

    /// Subscribe the MQTT command topics. Commands are queued and applied at
    /// the next tick.
    pub async fn subscribe_commands(&self) {
        let prefix = self.mqtt.prefix().to_string();

        type Build = fn(f32) -> Command;
        let entries: [(&str, Build); 6] = [
            ("huawei/cmd/mode", |v| Command::Mode(v as u8)),
            ("huawei/cmd/limit_online_voltage", Command::OnlineVoltage),
            ("huawei/cmd/limit_offline_voltage", Command::OfflineVoltage),
            ("huawei/cmd/limit_online_current", Command::OnlineCurrent),
            ("huawei/cmd/limit_offline_current", Command::OfflineCurrent),
            ("huawei/cmd/power", |v| Command::Power(v != 0.0)),
        ];

        for (subtopic, build) in entries {
            let pending = Arc::clone(&self.pending_commands);
            self.mqtt
                .subscribe(
                    &format!("{prefix}{subtopic}"),
                    Arc::new(move |topic, payload| match numeric_from_payload(payload, None) {
                        Ok(value) => pending.lock().push(build(value)),
                        Err(e) => warn!(topic, error = %e, "ignoring grid charger command"),
                    }),
                )
                .await;
        }
    }

    async fn publish_telemetry(&self) {
        if !self.mqtt.is_connected() {
            return;
        }

        let publish_interval = {
            let config = self.config.read();
            config.mqtt.publish_interval_secs as u32 * 1000
        };

        let now = uptime::millis();
        if uptime::elapsed(now, self.last_publish.load(Ordering::Relaxed)) < publish_interval {
            return;
        }
        self.last_publish.store(now, Ordering::Relaxed);

        let (data, mode) = {
            let inner = self.inner.lock().await;
            let Some(hardware) = inner.hardware.as_ref() else { return };
            (hardware.data_points(), inner.mode)
        };

        let rp = RectifierParameters::from_data_points(&data);
        self.mqtt
            .publish("huawei/input_voltage", rp.input_voltage.to_string())
            .await;
        self.mqtt
            .publish("huawei/input_power", rp.input_power.to_string())
            .await;
        self.mqtt
            .publish("huawei/output_voltage", rp.output_voltage.to_string())
            .await;
        self.mqtt
            .publish("huawei/output_current", rp.output_current.to_string())
            .await;
        self.mqtt
            .publish("huawei/output_power", rp.output_power.to_string())
            .await;
        self.mqtt
            .publish("huawei/efficiency", rp.efficiency.to_string())
            .await;
        self.mqtt
            .publish(
                "huawei/data_age",
                (uptime::elapsed(now, data.last_update(now)) / 1000).to_string(),
            )
            .await;
        self.mqtt
            .publish("huawei/mode", (mode as u8).to_string())
            .await;
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => controller.tick().await,
                }
            }
        });
    }
}

#[async_trait]
impl GridCharger for Controller {
    async fn auto_power_status(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.mode == Mode::AutoInt && inner.auto_power_enabled
    }
}
