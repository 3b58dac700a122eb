//! CAN plane of the Huawei rectifier.
//!
//! A dedicated task sleeps on a notification with a 500 ms timeout. It wakes
//! for outbound commands or on timeout, then drains the receive queue
//! (decoding only the status response frames), flushes the send queue
//! (re-queueing failed commands) and periodically emits a status request.
//!
//! Parameter writes are serialized through a FIFO queue; values are scaled
//! to the rectifier's integer units at enqueue time (voltage x1024, current
//! x20).

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::datapoints::DataPointContainer;
use crate::hardware::{CanFrame, CanInterface};
use crate::uptime;

/// Cadence of rectifier status requests.
pub const DATA_REQUEST_INTERVAL_MILLIS: u32 = 2500;

const STATUS_REQUEST_ID: u32 = 0x108040FE;
const PARAMETER_WRITE_ID: u32 = 0x108180FE;
const STATUS_RESPONSE_ID: u32 = 0x1081407F;

const VOLTAGE_MULTIPLIER: f32 = 1024.0;
const MAX_CURRENT_MULTIPLIER: f32 = 20.0;

crate::data_point_labels! {
    pub enum Label: Value {
        InputPower(f32, "Input Power", "W"),
        InputFrequency(f32, "Input Frequency", "Hz"),
        InputCurrent(f32, "Input Current", "A"),
        OutputPower(f32, "Output Power", "W"),
        Efficiency(f32, "Efficiency", ""),
        OutputVoltage(f32, "Output Voltage", "V"),
        OutputCurrentMax(f32, "Max Output Current", "A"),
        InputVoltage(f32, "Input Voltage", "V"),
        OutputTemperature(f32, "Output Temperature", "°C"),
        InputTemperature(f32, "Input Temperature", "°C"),
        OutputCurrent(f32, "Output Current", "A"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Setting {
    OnlineVoltage = 0,
    OfflineVoltage = 1,
    OnlineCurrent = 3,
    OfflineCurrent = 4,
}

pub struct HardwareInterface {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    bus: Arc<dyn CanInterface>,
    notify: Notify,
    state: Mutex<State>,
}

struct State {
    data: DataPointContainer<Label>,
    send_queue: VecDeque<(Setting, u16)>,
    next_request_millis: u32,
}

impl HardwareInterface {
    pub fn new(bus: Arc<dyn CanInterface>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                notify: Notify::new(),
                state: Mutex::new(State {
                    data: DataPointContainer::new(),
                    send_queue: VecDeque::new(),
                    next_request_millis: 0,
                }),
            }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn start(&mut self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                }
                inner.process();
            }
        }));
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.inner.notify.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Enqueue a parameter write and wake the bus task. The value is scaled
    /// to the rectifier's integer units here.
    pub fn set_parameter(&self, setting: Setting, value: f32) {
        let scaled = match setting {
            Setting::OnlineVoltage | Setting::OfflineVoltage => value * VOLTAGE_MULTIPLIER,
            Setting::OnlineCurrent | Setting::OfflineCurrent => value * MAX_CURRENT_MULTIPLIER,
        };

        self.inner
            .state
            .lock()
            .send_queue
            .push_back((setting, scaled as u16));

        self.inner.notify.notify_one();
    }

    /// Snapshot of the decoded rectifier data points.
    pub fn data_points(&self) -> DataPointContainer<Label> {
        self.inner.state.lock().data.clone()
    }

    /// Wake the bus task without enqueueing anything.
    pub fn poke(&self) {
        self.inner.notify.notify_one();
    }

    /// Immediate processing pass, for tests driving the interface without
    /// the background task.
    #[cfg(test)]
    fn process_now(&self) {
        self.inner.process();
    }
}

impl Inner {
    fn process(&self) {
        let mut state = self.state.lock();
        let now = uptime::millis();

        while let Some(frame) = self.bus.try_receive() {
            self.decode(&mut state, frame);
        }

        let queue_size = state.send_queue.len();
        for _ in 0..queue_size {
            let Some((setting, value)) = state.send_queue.pop_front() else { break };

            let mut data = [0u8; 8];
            data[0] = 0x01;
            data[1] = setting as u8;
            BigEndian::write_u16(&mut data[6..8], value);

            if let Err(e) = self.bus.send(CanFrame::new(PARAMETER_WRITE_ID, data)) {
                warn!(error = %e, "failed to set rectifier parameter, re-queueing");
                state.send_queue.push_back((setting, value));
            }
        }

        if uptime::at_or_after(now, state.next_request_millis) {
            if let Err(e) = self.bus.send(CanFrame::new(STATUS_REQUEST_ID, [0u8; 8])) {
                warn!(error = %e, "failed to send rectifier data request");
            }
            state.next_request_millis = now.wrapping_add(DATA_REQUEST_INTERVAL_MILLIS);
        }
    }

    fn decode(&self, state: &mut State, frame: CanFrame) {
        if frame.identifier & 0x1FFFFFFF != STATUS_RESPONSE_ID {
            return;
        }

        let value_id = BigEndian::read_u32(&frame.data[0..4]);
        let value = BigEndian::read_u32(&frame.data[4..8]);

        if value_id & 0xFF00FFFF != 0x01000000 {
            return;
        }

        let property = ((value_id & 0x00FF0000) >> 16) as u8;
        trace!(property, value, "rectifier property");

        let divisor = if property == 0x76 {
            MAX_CURRENT_MULTIPLIER
        } else {
            VOLTAGE_MULTIPLIER
        };
        let scaled = value as f32 / divisor;

        match property {
            0x70 => state.data.add::<InputPower>(scaled),
            0x71 => state.data.add::<InputFrequency>(scaled),
            0x72 => state.data.add::<InputCurrent>(scaled),
            0x73 => state.data.add::<OutputPower>(scaled),
            0x74 => state.data.add::<Efficiency>(scaled),
            0x75 => state.data.add::<OutputVoltage>(scaled),
            0x76 => state.data.add::<OutputCurrentMax>(scaled),
            0x78 => state.data.add::<InputVoltage>(scaled),
            0x7F => state.data.add::<OutputTemperature>(scaled),
            0x80 => state.data.add::<InputTemperature>(scaled),
            0x81 => state.data.add::<OutputCurrent>(scaled),
            _ => {}
        }
    }
}

/// Build a status response frame, as the rectifier would emit it. Used by
/// tests and the simulated hardware mode.
pub fn encode_status_response(property: u8, raw_value: u32) -> CanFrame {
    let mut data = [0u8; 8];
    BigEndian::write_u32(&mut data[0..4], 0x01000000 | ((property as u32) << 16));
    BigEndian::write_u32(&mut data[4..8], raw_value);
    CanFrame::new(STATUS_RESPONSE_ID, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedCanBus;

    fn interface() -> (HardwareInterface, SimulatedCanBus) {
        let bus = SimulatedCanBus::new();
        let interface = HardwareInterface::new(Arc::new(bus.clone()));
        (interface, bus)
    }

    #[test]
    fn decodes_status_responses() {
        let (interface, bus) = interface();

        bus.inject(encode_status_response(0x75, (52.0 * 1024.0) as u32));
        bus.inject(encode_status_response(0x81, (12.5 * 1024.0) as u32));
        bus.inject(encode_status_response(0x76, (30.0 * 20.0) as u32));
        interface.process_now();

        let data = interface.data_points();
        assert_eq!(data.get::<OutputVoltage>(), Some(52.0));
        assert_eq!(data.get::<OutputCurrent>(), Some(12.5));
        assert_eq!(data.get::<OutputCurrentMax>(), Some(30.0));
    }

    #[test]
    fn ignores_foreign_frames() {
        let (interface, bus) = interface();

        bus.inject(CanFrame::new(0x1081807E, [0xFF; 8]));
        // correct ID but wrong value id pattern
        let mut data = [0u8; 8];
        BigEndian::write_u32(&mut data[0..4], 0x02000000);
        bus.inject(CanFrame::new(STATUS_RESPONSE_ID, data));
        interface.process_now();

        assert!(interface.data_points().is_empty());
    }

    #[test]
    fn parameter_writes_are_scaled_and_framed() {
        let (interface, bus) = interface();

        interface.set_parameter(Setting::OnlineCurrent, 26.83);
        interface.set_parameter(Setting::OnlineVoltage, 52.5);
        interface.process_now();

        let sent = bus.drain_sent();
        // status request plus the two parameter writes
        let writes: Vec<_> = sent
            .iter()
            .filter(|frame| frame.identifier == PARAMETER_WRITE_ID)
            .collect();
        assert_eq!(writes.len(), 2);

        assert_eq!(writes[0].data[0], 0x01);
        assert_eq!(writes[0].data[1], Setting::OnlineCurrent as u8);
        assert_eq!(BigEndian::read_u16(&writes[0].data[6..8]), 536); // 26.83 A x20

        assert_eq!(writes[1].data[1], Setting::OnlineVoltage as u8);
        assert_eq!(BigEndian::read_u16(&writes[1].data[6..8]), 53760); // 52.5 V x1024
    }

    #[test]
    fn failed_writes_are_requeued() {
        let (interface, bus) = interface();

        // fill the TX queue so the parameter write fails
        while bus.send(CanFrame::new(0x0, [0u8; 8])).is_ok() {}

        interface.set_parameter(Setting::OnlineCurrent, 5.0);
        interface.process_now();

        // drain the bus and process again: the command goes out now
        bus.drain_sent();
        interface.process_now();

        let resent = bus
            .drain_sent()
            .into_iter()
            .any(|frame| frame.identifier == PARAMETER_WRITE_ID);
        assert!(resent);
    }

    #[test]
    fn status_requests_respect_cadence() {
        let (interface, bus) = interface();

        interface.process_now();
        interface.process_now();

        let requests = bus
            .drain_sent()
            .into_iter()
            .filter(|frame| frame.identifier == STATUS_REQUEST_ID)
            .count();
        assert_eq!(requests, 1);
    }
}
