//! Capability surface of the inverter radio stack.
//!
//! The power limiter governs inverters exclusively through this trait; the
//! radio protocol, retransmissions and statistics decoding live elsewhere.
//! Command acknowledgement is observed indirectly: a command counts as
//! applied once statistics newer than the command's issue time report the
//! requested state.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::uptime;

pub trait InverterHandle: Send + Sync {
    fn serial(&self) -> u64;

    fn is_reachable(&self) -> bool;
    fn is_producing(&self) -> bool;
    fn commands_enabled(&self) -> bool;
    fn supports_power_distribution_logic(&self) -> bool;

    /// Absolute maximum AC power of the device; 0 while unknown.
    fn max_power_watts(&self) -> u16;

    /// Last acknowledged power limit; `None` while unknown.
    fn current_limit_watts(&self) -> Option<u16>;

    fn ac_output_watts(&self) -> f32;

    /// Conversion efficiency in percent as reported with the statistics;
    /// 0 while the inverter is not producing.
    fn efficiency_percent(&self) -> f32;

    fn dc_voltage(&self, channel: u8) -> Option<f32>;

    fn mppts(&self) -> Vec<u8>;
    fn dc_channels_by_mppt(&self, mppt: u8) -> Vec<u8>;
    fn dc_channel_count(&self) -> usize;
    fn dc_power_watts(&self, channel: u8) -> f32;

    /// Uptime timestamp of the latest statistics reception.
    fn stats_millis(&self) -> u32;

    fn send_active_power_limit(&self, watts: u16) -> bool;
    fn send_power_state(&self, on: bool) -> bool;
    fn send_restart(&self) -> bool;
}

/// Resolves governed serials to radio handles.
pub trait InverterRegistry: Send + Sync {
    fn lookup(&self, serial: u64) -> Option<Arc<dyn InverterHandle>>;
}

// ---------------------------------------------------------------------------
// simulated implementation

#[derive(Debug, Clone)]
pub struct SimulatedInverterState {
    pub reachable: bool,
    pub commands_enabled: bool,
    pub producing: bool,
    pub supports_pdl: bool,
    pub max_power_watts: u16,
    pub current_limit_watts: Option<u16>,
    pub ac_output_watts: f32,
    pub efficiency_percent: f32,
    pub dc_voltage: f32,
    /// DC channels grouped by MPPT; index = MPPT, values = channel numbers.
    pub channels_per_mppt: Vec<Vec<u8>>,
    pub dc_power_per_channel: HashMap<u8, f32>,
    pub stats_millis: u32,
    /// Immediately reflect commands in the reported state and bump the
    /// stats timestamp, as a responsive inverter would.
    pub auto_ack: bool,
}

impl Default for SimulatedInverterState {
    fn default() -> Self {
        Self {
            reachable: true,
            commands_enabled: true,
            producing: false,
            supports_pdl: false,
            max_power_watts: 1500,
            current_limit_watts: None,
            ac_output_watts: 0.0,
            efficiency_percent: 96.0,
            dc_voltage: 48.0,
            channels_per_mppt: vec![vec![0], vec![1]],
            dc_power_per_channel: HashMap::new(),
            stats_millis: 0,
            auto_ack: true,
        }
    }
}

/// Inverter handle for development and testing: state is fully scriptable
/// and every command is recorded.
pub struct SimulatedInverterHandle {
    serial: u64,
    state: Mutex<SimulatedInverterState>,
    sent_limits: Mutex<Vec<u16>>,
    sent_power_states: Mutex<Vec<bool>>,
    restarts: Mutex<u32>,
}

impl SimulatedInverterHandle {
    pub fn new(serial: u64) -> Arc<Self> {
        Arc::new(Self {
            serial,
            state: Mutex::new(SimulatedInverterState::default()),
            sent_limits: Mutex::new(Vec::new()),
            sent_power_states: Mutex::new(Vec::new()),
            restarts: Mutex::new(0),
        })
    }

    pub fn with_state(serial: u64, state: SimulatedInverterState) -> Arc<Self> {
        let handle = Self::new(serial);
        *handle.state.lock() = state;
        handle
    }

    pub fn modify_state<F: FnOnce(&mut SimulatedInverterState)>(&self, f: F) {
        f(&mut self.state.lock());
    }

    /// Mark fresh statistics as received now.
    pub fn touch_stats(&self) {
        self.state.lock().stats_millis = uptime::millis();
    }

    pub fn sent_limits(&self) -> Vec<u16> {
        self.sent_limits.lock().clone()
    }

    pub fn last_sent_limit(&self) -> Option<u16> {
        self.sent_limits.lock().last().copied()
    }

    pub fn sent_power_states(&self) -> Vec<bool> {
        self.sent_power_states.lock().clone()
    }

    pub fn restart_count(&self) -> u32 {
        *self.restarts.lock()
    }
}

impl InverterHandle for SimulatedInverterHandle {
    fn serial(&self) -> u64 {
        self.serial
    }

    fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    fn is_producing(&self) -> bool {
        self.state.lock().producing
    }

    fn commands_enabled(&self) -> bool {
        self.state.lock().commands_enabled
    }

    fn supports_power_distribution_logic(&self) -> bool {
        self.state.lock().supports_pdl
    }

    fn max_power_watts(&self) -> u16 {
        self.state.lock().max_power_watts
    }

    fn current_limit_watts(&self) -> Option<u16> {
        self.state.lock().current_limit_watts
    }

    fn ac_output_watts(&self) -> f32 {
        self.state.lock().ac_output_watts
    }

    fn efficiency_percent(&self) -> f32 {
        self.state.lock().efficiency_percent
    }

    fn dc_voltage(&self, _channel: u8) -> Option<f32> {
        let state = self.state.lock();
        if state.reachable {
            Some(state.dc_voltage)
        } else {
            None
        }
    }

    fn mppts(&self) -> Vec<u8> {
        let state = self.state.lock();
        (0..state.channels_per_mppt.len() as u8).collect()
    }

    fn dc_channels_by_mppt(&self, mppt: u8) -> Vec<u8> {
        let state = self.state.lock();
        state
            .channels_per_mppt
            .get(mppt as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn dc_channel_count(&self) -> usize {
        let state = self.state.lock();
        state.channels_per_mppt.iter().map(Vec::len).sum()
    }

    fn dc_power_watts(&self, channel: u8) -> f32 {
        let state = self.state.lock();
        state.dc_power_per_channel.get(&channel).copied().unwrap_or(0.0)
    }

    fn stats_millis(&self) -> u32 {
        self.state.lock().stats_millis
    }

    fn send_active_power_limit(&self, watts: u16) -> bool {
        self.sent_limits.lock().push(watts);

        let mut state = self.state.lock();
        if state.auto_ack {
            state.current_limit_watts = Some(watts);
            state.stats_millis = uptime::millis();
        }
        true
    }

    fn send_power_state(&self, on: bool) -> bool {
        self.sent_power_states.lock().push(on);

        let mut state = self.state.lock();
        if state.auto_ack {
            state.producing = on;
            if !on {
                state.ac_output_watts = 0.0;
            }
            state.stats_millis = uptime::millis();
        }
        true
    }

    fn send_restart(&self) -> bool {
        *self.restarts.lock() += 1;
        true
    }
}

#[derive(Default)]
pub struct SimulatedInverterRegistry {
    handles: Mutex<HashMap<u64, Arc<SimulatedInverterHandle>>>,
}

impl SimulatedInverterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, handle: Arc<SimulatedInverterHandle>) {
        self.handles.lock().insert(handle.serial(), handle);
    }

    pub fn get(&self, serial: u64) -> Option<Arc<SimulatedInverterHandle>> {
        self.handles.lock().get(&serial).cloned()
    }
}

impl InverterRegistry for SimulatedInverterRegistry {
    fn lookup(&self, serial: u64) -> Option<Arc<dyn InverterHandle>> {
        self.handles
            .lock()
            .get(&serial)
            .cloned()
            .map(|handle| handle as Arc<dyn InverterHandle>)
    }
}
