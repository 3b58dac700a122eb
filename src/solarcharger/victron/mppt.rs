//! VE.Direct MPPT charge controller logic.
//!
//! Two substreams share one UART: the device periodically pushes TEXT frames
//! with its primary values, and a HEX request/response channel serves
//! everything else. The byte-level codec lives behind [`VeDirectLink`]; this
//! module owns the request schedule and the decoded state.
//!
//! Scheduler invariants: a HEX command is only sent while no partial TEXT
//! frame is being received, and at most one command is outstanding — the
//! next send waits for the response or a timeout.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::uptime;

/// Response timeout after which the outstanding command is given up on.
const SEND_TIMEOUT_MILLIS: u32 = 500;

/// Registers send their read request every `period * 1000` ms.
const HIGH_PRIO_COMMAND: u8 = 1;
const WRITE_ONLY_COMMAND: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HexRegister {
    DeviceCapabilities = 0x0140,
    ChargeVoltageSetPoint = 0x2001,
    BatteryVoltageSense = 0x2002,
    BatteryTemperatureSense = 0x2003,
    BatteryChargeCurrent = 0x200A,
    NetworkMode = 0x200E,
    NetworkStatus = 0x200F,
    ChargeCurrentLimit = 0x2015,
    NetworkTotalDcInputPower = 0x2027,
    BatteryVoltageSetting = 0xEDEA,
    BatteryAbsorptionVoltage = 0xEDF7,
    BatteryFloatVoltage = 0xEDF6,
    ChargeControllerTemperature = 0xEDDB,
    SmartBatterySenseTemperature = 0xEDEC,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HexWrite {
    pub size_bits: u8,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HexRequest {
    pub register: HexRegister,
    /// `None` issues a GET, `Some` a SET.
    pub write: Option<HexWrite>,
}

/// A decoded TEXT frame, produced by the wire codec after checksum
/// validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextFrame {
    pub serial: String,
    pub battery_voltage_mv: u32,
    pub battery_output_power_w: i16,
    pub panel_voltage_mv: u32,
    pub panel_power_w: u16,
    pub yield_total_wh: u32,
    pub yield_today_wh: u32,
    pub current_state: u8,
    pub error_code: u8,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    TextFrame(TextFrame),
    HexResponse { register: HexRegister, value: u32 },
}

/// Transport seam toward the serial codec.
pub trait VeDirectLink: Send + Sync {
    fn poll(&mut self) -> Option<LinkEvent>;
    fn send_hex(&mut self, request: HexRequest) -> anyhow::Result<()>;

    /// False while a TEXT frame is partially received; HEX traffic would
    /// corrupt it.
    fn is_idle(&self) -> bool;
}

/// A value received through the HEX channel; invalid while never received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamped<T> {
    pub at: u32,
    pub value: T,
}

#[derive(Debug, Clone, Default)]
pub struct MpptData {
    pub serial: String,
    pub battery_voltage_mv: u32,
    pub battery_output_power_w: i16,
    pub panel_voltage_mv: u32,
    pub panel_power_w: u16,
    pub yield_total_wh: u32,
    pub yield_today_wh: u32,
    pub current_state: u8,
    pub error_code: u8,

    /// Moving-average conversion efficiency in percent.
    pub efficiency_percent: f32,

    pub network_total_dc_input_power_mw: Option<Timestamped<u32>>,
    pub battery_absorption_mv: Option<Timestamped<u32>>,
    pub battery_float_mv: Option<Timestamped<u32>>,
    /// 0.1 A units as reported by the device.
    pub charge_current_limit: Option<Timestamped<u32>>,
    pub mppt_temperature_m_celsius: Option<Timestamped<i32>>,
    pub battery_sense_temperature_m_celsius: Option<Timestamped<i32>>,
    pub network_status: Option<Timestamped<u8>>,
    pub device_capabilities: Option<Timestamped<u32>>,
    pub battery_voltage_setting_v: Option<Timestamped<u8>>,
}

#[derive(Debug)]
pub struct MovingAverage<const N: usize> {
    window: [f32; N],
    sum: f32,
    index: usize,
    count: usize,
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self { window: [0.0; N], sum: 0.0, index: 0, count: 0 }
    }
}

impl<const N: usize> MovingAverage<N> {
    pub fn add_number(&mut self, number: f32) {
        if self.count < N {
            self.count += 1;
        } else {
            self.sum -= self.window[self.index];
        }

        self.window[self.index] = number;
        self.sum += number;
        self.index = (self.index + 1) % N;
    }

    pub fn average(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f32
    }
}

struct HexScheduleEntry {
    register: HexRegister,
    /// 0 = write-only, 1 = high prio (sent every loop that allows HEX),
    /// n = every n seconds.
    read_period_secs: u8,
    last_send: u32,
    write_size_bits: u8,
    write_value: Option<u32>,
}

impl HexScheduleEntry {
    const fn new(register: HexRegister, read_period_secs: u8, write_size_bits: u8) -> Self {
        Self {
            register,
            read_period_secs,
            last_send: 0,
            write_size_bits,
            write_value: None,
        }
    }
}

pub struct MpptController {
    link: Box<dyn VeDirectLink>,
    data: MpptData,
    last_update: u32,
    efficiency: MovingAverage<5>,
    schedule: [HexScheduleEntry; 14],
    queue_index: usize,
    awaiting_response: bool,
    send_timeout: u32,
}

impl MpptController {
    pub fn new(link: Box<dyn VeDirectLink>) -> Self {
        // slow-changing values use a four second read period
        let schedule = [
            HexScheduleEntry::new(HexRegister::NetworkTotalDcInputPower, HIGH_PRIO_COMMAND, 0),
            HexScheduleEntry::new(HexRegister::NetworkStatus, 4, 0),
            HexScheduleEntry::new(HexRegister::DeviceCapabilities, 4, 0),
            HexScheduleEntry::new(HexRegister::ChargeControllerTemperature, 4, 0),
            HexScheduleEntry::new(HexRegister::SmartBatterySenseTemperature, 4, 0),
            HexScheduleEntry::new(HexRegister::BatteryVoltageSetting, 4, 0),
            HexScheduleEntry::new(HexRegister::BatteryFloatVoltage, 4, 0),
            HexScheduleEntry::new(HexRegister::BatteryAbsorptionVoltage, 4, 0),
            HexScheduleEntry::new(HexRegister::ChargeCurrentLimit, 4, 16),
            HexScheduleEntry::new(HexRegister::NetworkMode, WRITE_ONLY_COMMAND, 8),
            HexScheduleEntry::new(HexRegister::ChargeVoltageSetPoint, WRITE_ONLY_COMMAND, 16),
            HexScheduleEntry::new(HexRegister::BatteryChargeCurrent, WRITE_ONLY_COMMAND, 32),
            HexScheduleEntry::new(HexRegister::BatteryVoltageSense, WRITE_ONLY_COMMAND, 16),
            HexScheduleEntry::new(HexRegister::BatteryTemperatureSense, WRITE_ONLY_COMMAND, 16),
        ];

        Self {
            link,
            data: MpptData::default(),
            last_update: 0,
            efficiency: MovingAverage::default(),
            schedule,
            queue_index: 0,
            awaiting_response: false,
            send_timeout: 0,
        }
    }

    pub fn data(&self) -> &MpptData {
        &self.data
    }

    pub fn serial(&self) -> &str {
        &self.data.serial
    }

    /// Uptime of the last valid TEXT frame; 0 while none received.
    pub fn last_update(&self) -> u32 {
        self.last_update
    }

    pub fn tick(&mut self, now: u32) {
        while let Some(event) = self.link.poll() {
            match event {
                LinkEvent::TextFrame(frame) => self.frame_valid_event(frame, now),
                LinkEvent::HexResponse { register, value } => {
                    self.awaiting_response = false;
                    self.hex_data_handler(register, value, now);
                }
            }
        }

        if self.is_hex_command_possible(now) {
            self.send_next_hex_command(now);
        }
    }

    fn is_hex_command_possible(&self, now: u32) -> bool {
        if !self.link.is_idle() {
            return false;
        }
        !self.awaiting_response || uptime::at_or_after(now, self.send_timeout)
    }

    fn frame_valid_event(&mut self, frame: TextFrame, now: u32) {
        if frame.panel_power_w > 0 {
            let output = frame.battery_output_power_w.max(0) as f32;
            self.efficiency
                .add_number(100.0 * output / frame.panel_power_w as f32);
        }

        self.data.serial = frame.serial;
        self.data.battery_voltage_mv = frame.battery_voltage_mv;
        self.data.battery_output_power_w = frame.battery_output_power_w;
        self.data.panel_voltage_mv = frame.panel_voltage_mv;
        self.data.panel_power_w = frame.panel_power_w;
        self.data.yield_total_wh = frame.yield_total_wh;
        self.data.yield_today_wh = frame.yield_today_wh;
        self.data.current_state = frame.current_state;
        self.data.error_code = frame.error_code;
        self.data.efficiency_percent = self.efficiency.average();

        self.last_update = now;
    }

    fn hex_data_handler(&mut self, register: HexRegister, value: u32, now: u32) {
        trace!(?register, value, "HEX response");

        match register {
            HexRegister::NetworkTotalDcInputPower => {
                self.data.network_total_dc_input_power_mw =
                    Some(Timestamped { at: now, value });
            }
            // reported in 0.01 V
            HexRegister::BatteryAbsorptionVoltage => {
                self.data.battery_absorption_mv =
                    Some(Timestamped { at: now, value: value * 10 });
            }
            HexRegister::BatteryFloatVoltage => {
                self.data.battery_float_mv = Some(Timestamped { at: now, value: value * 10 });
            }
            HexRegister::ChargeCurrentLimit => {
                self.data.charge_current_limit = Some(Timestamped { at: now, value });
            }
            // reported in 0.01 degC
            HexRegister::ChargeControllerTemperature => {
                self.data.mppt_temperature_m_celsius =
                    Some(Timestamped { at: now, value: value as i32 * 10 });
            }
            HexRegister::SmartBatterySenseTemperature => {
                self.data.battery_sense_temperature_m_celsius =
                    Some(Timestamped { at: now, value: value as i32 * 10 });
            }
            HexRegister::NetworkStatus => {
                self.data.network_status = Some(Timestamped { at: now, value: value as u8 });
            }
            HexRegister::DeviceCapabilities => {
                self.data.device_capabilities = Some(Timestamped { at: now, value });
            }
            HexRegister::BatteryVoltageSetting => {
                self.data.battery_voltage_setting_v =
                    Some(Timestamped { at: now, value: value as u8 });
            }
            _ => debug!(?register, value, "unhandled HEX response"),
        }
    }

    /// Scan the schedule from the current queue position and send the first
    /// due command. Write-only entries are due only while a write is
    /// pending; high-prio entries are always due.
    fn send_next_hex_command(&mut self, now: u32) {
        for _ in 0..self.schedule.len() {
            let index = self.queue_index;
            let entry = &mut self.schedule[index];

            let due = match entry.read_period_secs {
                WRITE_ONLY_COMMAND => entry.write_value.is_some(),
                HIGH_PRIO_COMMAND => true,
                period => {
                    entry.write_value.is_some()
                        || uptime::elapsed(now, entry.last_send) >= period as u32 * 1000
                }
            };

            if !due {
                self.queue_index = (self.queue_index + 1) % self.schedule.len();
                continue;
            }

            let write = entry.write_value.take().map(|value| HexWrite {
                size_bits: entry.write_size_bits,
                value,
            });

            let request = HexRequest { register: entry.register, write };
            match self.link.send_hex(request) {
                Ok(()) => {
                    entry.last_send = now;
                    self.awaiting_response = true;
                    self.send_timeout = now.wrapping_add(SEND_TIMEOUT_MILLIS);
                }
                Err(e) => warn!(register = ?entry.register, error = %e, "HEX send failed"),
            }

            self.queue_index = (index + 1) % self.schedule.len();
            return;
        }
    }

    fn enqueue_write(&mut self, register: HexRegister, value: u32) {
        if let Some(entry) = self
            .schedule
            .iter_mut()
            .find(|entry| entry.register == register)
        {
            entry.write_value = Some(value);
        }
    }

    pub fn set_remote_mode(&mut self, mode: u8) {
        self.enqueue_write(HexRegister::NetworkMode, mode as u32);
    }

    /// Charge voltage setpoint; device expects 0.01 V units.
    pub fn set_remote_charge_voltage_set_point(&mut self, volt: f32) {
        self.enqueue_write(HexRegister::ChargeVoltageSetPoint, (volt * 100.0) as u32);
    }

    /// Battery voltage sense; device expects 0.01 V units.
    pub fn set_remote_voltage(&mut self, volt: f32) {
        self.enqueue_write(HexRegister::BatteryVoltageSense, (volt * 100.0) as u32);
    }

    /// Battery temperature sense; device expects 0.01 degC units.
    pub fn set_remote_temperature(&mut self, degree_celsius: f32) {
        self.enqueue_write(
            HexRegister::BatteryTemperatureSense,
            (degree_celsius * 100.0) as u32,
        );
    }

    /// Battery charge current; device expects 0.001 A units.
    pub fn set_remote_current(&mut self, ampere: f32) {
        self.enqueue_write(HexRegister::BatteryChargeCurrent, (ampere * 1000.0) as u32);
    }

    /// Charge current limit; device expects 0.1 A units.
    pub fn set_remote_charge_current_limit(&mut self, ampere: f32) {
        self.enqueue_write(HexRegister::ChargeCurrentLimit, (ampere * 10.0) as u32);
    }
}

/// Link backed by in-process queues, for tests and the simulated hardware
/// mode. The returned handle is the "device side".
pub fn simulated_link() -> (Box<dyn VeDirectLink>, SimulatedLinkHandle) {
    let state = Arc::new(Mutex::new(SimulatedLinkState::default()));
    (
        Box::new(SimulatedLink { state: Arc::clone(&state) }),
        SimulatedLinkHandle { state },
    )
}

#[derive(Default)]
struct SimulatedLinkState {
    events: VecDeque<LinkEvent>,
    sent: Vec<HexRequest>,
    busy: bool,
}

struct SimulatedLink {
    state: Arc<Mutex<SimulatedLinkState>>,
}

impl VeDirectLink for SimulatedLink {
    fn poll(&mut self) -> Option<LinkEvent> {
        self.state.lock().events.pop_front()
    }

    fn send_hex(&mut self, request: HexRequest) -> anyhow::Result<()> {
        self.state.lock().sent.push(request);
        Ok(())
    }

    fn is_idle(&self) -> bool {
        !self.state.lock().busy
    }
}

#[derive(Clone)]
pub struct SimulatedLinkHandle {
    state: Arc<Mutex<SimulatedLinkState>>,
}

impl SimulatedLinkHandle {
    pub fn push_text_frame(&self, frame: TextFrame) {
        self.state.lock().events.push_back(LinkEvent::TextFrame(frame));
    }

    pub fn push_hex_response(&self, register: HexRegister, value: u32) {
        self.state
            .lock()
            .events
            .push_back(LinkEvent::HexResponse { register, value });
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    pub fn drain_sent(&self) -> Vec<HexRequest> {
        self.state.lock().sent.drain(..).collect()
    }
}
