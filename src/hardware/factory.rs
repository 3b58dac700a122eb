//! Transport construction per hardware mode.
//!
//! Controllers ask the factory for their buses and links; the factory
//! decides what actually backs them. Simulated transports are first-class:
//! they carry development, testing and any deployment where the real chip
//! driver is not wired up yet. The device-side handles stay accessible so
//! tests and simulation tasks can drive the other end.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use super::{CanInterface, SimulatedCanBus};
use crate::config::{GridChargerCanInterface, HardwareMode};
use crate::solarcharger::victron::mppt::{simulated_link, SimulatedLinkHandle, VeDirectLink};

pub struct TransportFactory {
    mode: HardwareMode,
    grid_charger_bus: Mutex<Option<SimulatedCanBus>>,
    battery_bus: Mutex<Option<SimulatedCanBus>>,
    vedirect_handles: Mutex<Vec<SimulatedLinkHandle>>,
}

impl TransportFactory {
    pub fn new(mode: HardwareMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            grid_charger_bus: Mutex::new(None),
            battery_bus: Mutex::new(None),
            vedirect_handles: Mutex::new(Vec::new()),
        })
    }

    /// CAN bus toward the grid charger. Real MCP2515/TWAI drivers would plug
    /// in here; both hardware modes currently back it with the simulated
    /// bus.
    pub fn create_grid_charger_can_bus(
        &self,
        interface: GridChargerCanInterface,
    ) -> Arc<dyn CanInterface> {
        info!(?interface, mode = ?self.mode, "creating simulated grid charger CAN bus");

        let bus = SimulatedCanBus::new();
        *self.grid_charger_bus.lock() = Some(bus.clone());
        Arc::new(bus)
    }

    /// Device-side handle of the most recently created grid charger bus.
    pub fn grid_charger_bus_handle(&self) -> Option<SimulatedCanBus> {
        self.grid_charger_bus.lock().clone()
    }

    /// CAN bus carrying the BMS broadcast.
    pub fn create_battery_can_bus(&self) -> Arc<dyn CanInterface> {
        info!(mode = ?self.mode, "creating simulated battery CAN bus");

        let bus = SimulatedCanBus::new();
        *self.battery_bus.lock() = Some(bus.clone());
        Arc::new(bus)
    }

    pub fn battery_bus_handle(&self) -> Option<SimulatedCanBus> {
        self.battery_bus.lock().clone()
    }

    /// VE.Direct link for one charge controller instance.
    pub fn create_vedirect_link(&self, instance: u8) -> Box<dyn VeDirectLink> {
        info!(instance, mode = ?self.mode, "creating simulated VE.Direct link");

        let (link, handle) = simulated_link();
        self.vedirect_handles.lock().push(handle);
        link
    }

    pub fn vedirect_handles(&self) -> Vec<SimulatedLinkHandle> {
        self.vedirect_handles.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::CanFrame;

    #[test]
    fn grid_charger_bus_handle_is_shared() {
        let factory = TransportFactory::new(HardwareMode::Simulated);
        let bus = factory.create_grid_charger_can_bus(GridChargerCanInterface::Mcp2515);

        let handle = factory.grid_charger_bus_handle().unwrap();
        handle.inject(CanFrame::new(0x1081407F, [0; 8]));

        assert!(bus.try_receive().is_some());
    }

    #[test]
    fn vedirect_links_register_their_handles() {
        let factory = TransportFactory::new(HardwareMode::Simulated);
        let _link = factory.create_vedirect_link(1);
        let _link2 = factory.create_vedirect_link(2);

        assert_eq!(factory.vedirect_handles().len(), 2);
    }
}
