//! Hardware transport abstractions.
//!
//! Controllers talk to buses through narrow traits so that chip-specific
//! drivers (MCP2515 over SPI, on-chip TWAI) and the simulated transports
//! used for development and testing are interchangeable.

pub mod factory;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// An extended-frame CAN message, mirroring the on-chip driver's
/// message layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub identifier: u32,
    pub data: [u8; 8],
    pub dlc: u8,
}

impl CanFrame {
    pub fn new(identifier: u32, data: [u8; 8]) -> Self {
        Self { identifier, data, dlc: 8 }
    }

    pub fn with_dlc(identifier: u32, data: [u8; 8], dlc: u8) -> Self {
        Self { identifier, data, dlc }
    }
}

#[derive(Debug, Error)]
pub enum CanError {
    #[error("CAN transmit queue full")]
    TxQueueFull,
    #[error("CAN interface not operational")]
    NotOperational,
}

/// A CAN bus endpoint. `send` must not block; `try_receive` drains the
/// receive hardware while messages are available.
pub trait CanInterface: Send + Sync {
    fn send(&self, frame: CanFrame) -> Result<(), CanError>;
    fn try_receive(&self) -> Option<CanFrame>;
}

const SIMULATED_QUEUE_DEPTH: usize = 32;

/// In-process CAN bus backed by bounded queues. The controller side
/// implements [`CanInterface`]; tests and simulated devices drive the other
/// end through [`inject`](Self::inject) and [`pop_sent`](Self::pop_sent).
#[derive(Clone, Default)]
pub struct SimulatedCanBus {
    inner: Arc<SimulatedCanBusInner>,
}

#[derive(Default)]
struct SimulatedCanBusInner {
    to_controller: Mutex<VecDeque<CanFrame>>,
    from_controller: Mutex<VecDeque<CanFrame>>,
}

impl SimulatedCanBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device side: queue a frame for the controller to receive.
    pub fn inject(&self, frame: CanFrame) {
        self.inner.to_controller.lock().push_back(frame);
    }

    /// Device side: take the next frame the controller transmitted.
    pub fn pop_sent(&self) -> Option<CanFrame> {
        self.inner.from_controller.lock().pop_front()
    }

    /// Device side: drain everything the controller transmitted.
    pub fn drain_sent(&self) -> Vec<CanFrame> {
        self.inner.from_controller.lock().drain(..).collect()
    }
}

impl CanInterface for SimulatedCanBus {
    fn send(&self, frame: CanFrame) -> Result<(), CanError> {
        let mut queue = self.inner.from_controller.lock();
        if queue.len() >= SIMULATED_QUEUE_DEPTH {
            return Err(CanError::TxQueueFull);
        }
        queue.push_back(frame);
        Ok(())
    }

    fn try_receive(&self) -> Option<CanFrame> {
        self.inner.to_controller.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_pass_in_both_directions() {
        let bus = SimulatedCanBus::new();

        bus.inject(CanFrame::new(0x351, [1, 2, 3, 4, 5, 6, 7, 8]));
        let received = bus.try_receive().unwrap();
        assert_eq!(received.identifier, 0x351);
        assert_eq!(received.data[0], 1);
        assert!(bus.try_receive().is_none());

        bus.send(CanFrame::new(0x108040FE, [0; 8])).unwrap();
        assert_eq!(bus.pop_sent().unwrap().identifier, 0x108040FE);
    }

    #[test]
    fn transmit_queue_is_bounded() {
        let bus = SimulatedCanBus::new();
        for _ in 0..SIMULATED_QUEUE_DEPTH {
            bus.send(CanFrame::new(0x1, [0; 8])).unwrap();
        }
        assert!(matches!(
            bus.send(CanFrame::new(0x1, [0; 8])),
            Err(CanError::TxQueueFull)
        ));
    }
}
