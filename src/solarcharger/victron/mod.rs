//! Victron VE.Direct MPPT provider: one controller instance per hardware
//! serial port, aggregated into the subsystem stats.

pub mod mppt;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Provider, StateOfOperation, Stats};
use crate::hardware::factory::TransportFactory;
use crate::serial_ports::SerialPortAllocator;
use crate::uptime;
use mppt::{MpptController, MpptData};

/// Instance data older than this is excluded from every aggregation.
const STALE_MILLIS: u32 = 10 * 1000;

#[derive(Default)]
pub struct VictronStats {
    instances: Mutex<HashMap<String, (MpptData, u32)>>,
}

impl VictronStats {
    pub fn update(&self, serial: &str, data: MpptData, last_update: u32) {
        if serial.is_empty() {
            return;
        }
        self.instances
            .lock()
            .insert(serial.to_string(), (data, last_update));
    }

    fn is_stale(last_update: u32, now: u32) -> bool {
        last_update == 0 || uptime::elapsed(now, last_update) > STALE_MILLIS
    }

    fn fold<T, F>(&self, mut fold: F) -> Option<T>
    where
        F: FnMut(Option<T>, &MpptData) -> Option<T>,
    {
        let now = uptime::millis();
        let instances = self.instances.lock();

        let mut accumulator = None;
        for (data, last_update) in instances.values() {
            if Self::is_stale(*last_update, now) {
                continue;
            }
            accumulator = fold(accumulator, data);
        }
        accumulator
    }
}

impl Stats for VictronStats {
    fn age_millis(&self) -> u32 {
        let now = uptime::millis();
        let instances = self.instances.lock();

        let mut age = 0;
        for (_, last_update) in instances.values() {
            if *last_update == 0 {
                continue;
            }
            age = age.max(uptime::elapsed(now, *last_update));
        }
        age
    }

    fn output_power_watts(&self) -> Option<f32> {
        // an instance that is part of a VE.Smart network knows the total DC
        // input power of the whole network; derive the output power through
        // the instance's conversion efficiency instead of summing
        let network = self.fold(|found: Option<f32>, data| {
            found.or(data
                .network_total_dc_input_power_mw
                .filter(|power| power.at > 0)
                .map(|power| power.value as f32 / 1000.0 * data.efficiency_percent / 100.0))
        });
        if network.is_some() {
            return network;
        }

        self.fold(|sum, data| {
            Some(sum.unwrap_or(0.0) + data.battery_output_power_w.max(0) as f32)
        })
    }

    fn output_voltage(&self) -> Option<f32> {
        self.fold(|minimum: Option<f32>, data| {
            let volts = data.battery_voltage_mv as f32 / 1000.0;
            Some(minimum.map_or(volts, |m| m.min(volts)))
        })
    }

    fn panel_power_watts(&self) -> Option<f32> {
        let network = self.fold(|found: Option<f32>, data| {
            found.or(data
                .network_total_dc_input_power_mw
                .filter(|power| power.at > 0)
                .map(|power| power.value as f32 / 1000.0))
        });
        if network.is_some() {
            return network;
        }

        self.fold(|sum, data| Some(sum.unwrap_or(0.0) + data.panel_power_w as f32))
    }

    fn yield_total_kwh(&self) -> Option<f32> {
        self.fold(|sum, data| Some(sum.unwrap_or(0.0) + data.yield_total_wh as f32 / 1000.0))
    }

    fn yield_day_wh(&self) -> Option<f32> {
        self.fold(|sum, data| Some(sum.unwrap_or(0.0) + data.yield_today_wh as f32))
    }

    fn state_of_operation(&self) -> Option<StateOfOperation> {
        self.fold(|first, data| {
            first.or(Some(match data.current_state {
                0 => StateOfOperation::Off,
                3 => StateOfOperation::Bulk,
                4 => StateOfOperation::Absorption,
                5 => StateOfOperation::Float,
                _ => StateOfOperation::Various,
            }))
        })
    }

    fn absorption_voltage(&self) -> Option<f32> {
        self.fold(|first, data| {
            first.or(data
                .battery_absorption_mv
                .filter(|voltage| voltage.at > 0)
                .map(|voltage| voltage.value as f32 / 1000.0))
        })
    }

    fn float_voltage(&self) -> Option<f32> {
        self.fold(|first, data| {
            first.or(data
                .battery_float_mv
                .filter(|voltage| voltage.at > 0)
                .map(|voltage| voltage.value as f32 / 1000.0))
        })
    }
}

pub struct VictronProvider {
    instance_count: u8,
    serial_ports: Arc<SerialPortAllocator>,
    factory: Arc<TransportFactory>,
    controllers: Vec<MpptController>,
    port_owners: Vec<String>,
    stats: Arc<VictronStats>,
}

impl VictronProvider {
    pub fn new(
        instance_count: u8,
        serial_ports: Arc<SerialPortAllocator>,
        factory: Arc<TransportFactory>,
    ) -> Self {
        Self {
            instance_count,
            serial_ports,
            factory,
            controllers: Vec::new(),
            port_owners: Vec::new(),
            stats: Arc::new(VictronStats::default()),
        }
    }

    /// Remote charge current limit applied to every instance.
    pub fn set_charge_current_limit(&mut self, ampere: f32) {
        for controller in &mut self.controllers {
            controller.set_remote_charge_current_limit(ampere);
        }
    }
}

#[async_trait]
impl Provider for VictronProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        for instance in 1..=self.instance_count {
            let owner = format!("Victron MPPT {instance}");

            let Some(port) = self.serial_ports.allocate_port(&owner) else {
                warn!(owner, "no serial port available, skipping instance");
                continue;
            };

            let link = self.factory.create_vedirect_link(instance);
            self.controllers.push(MpptController::new(link));
            self.port_owners.push(owner.clone());
            info!(owner, port, "VE.Direct instance ready");
        }

        anyhow::ensure!(
            !self.controllers.is_empty(),
            "no VE.Direct instance could be initialized"
        );
        Ok(())
    }

    async fn deinit(&mut self) {
        self.controllers.clear();
        for owner in self.port_owners.drain(..) {
            self.serial_ports.free_port(&owner);
        }
    }

    async fn tick(&mut self) {
        let now = uptime::millis();
        for controller in &mut self.controllers {
            controller.tick(now);
            self.stats.update(
                controller.serial(),
                controller.data().clone(),
                controller.last_update(),
            );
        }
    }

    fn stats(&self) -> Arc<dyn Stats> {
        Arc::clone(&self.stats) as Arc<dyn Stats>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mppt::Timestamped;

    fn instance(serial: &str, output_w: i16, voltage_mv: u32, panel_w: u16) -> MpptData {
        MpptData {
            serial: serial.to_string(),
            battery_output_power_w: output_w,
            battery_voltage_mv: voltage_mv,
            panel_power_w: panel_w,
            yield_total_wh: 10_000,
            yield_today_wh: 800,
            efficiency_percent: 95.0,
            ..Default::default()
        }
    }

    #[test]
    fn empty_stats_yield_nothing() {
        let stats = VictronStats::default();
        assert_eq!(stats.output_power_watts(), None);
        assert_eq!(stats.output_voltage(), None);
        assert_eq!(stats.age_millis(), 0);
    }

    #[test]
    fn aggregation_sums_power_and_takes_minimum_voltage() {
        let now = uptime::millis().max(1);
        let stats = VictronStats::default();
        stats.update("A", instance("A", 300, 52_500, 340), now);
        stats.update("B", instance("B", 150, 51_900, 170), now);

        assert_eq!(stats.output_power_watts(), Some(450.0));
        assert_eq!(stats.output_voltage(), Some(51.9));
        assert_eq!(stats.panel_power_watts(), Some(510.0));
        assert_eq!(stats.yield_total_kwh(), Some(20.0));
        assert_eq!(stats.yield_day_wh(), Some(1600.0));
    }

    #[test]
    fn negative_output_power_clamps_to_zero() {
        let now = uptime::millis().max(1);
        let stats = VictronStats::default();
        stats.update("A", instance("A", -20, 52_000, 0), now);

        assert_eq!(stats.output_power_watts(), Some(0.0));
    }

    #[test]
    fn network_total_overrides_sums() {
        let now = uptime::millis().max(1);
        let stats = VictronStats::default();

        let mut networked = instance("A", 300, 52_500, 340);
        networked.network_total_dc_input_power_mw = Some(Timestamped { at: now, value: 600_000 });
        stats.update("A", networked, now);
        stats.update("B", instance("B", 150, 51_900, 170), now);

        assert_eq!(stats.panel_power_watts(), Some(600.0));
        // output derived through the instance's efficiency
        assert!((stats.output_power_watts().unwrap() - 570.0).abs() < 0.01);
    }

    #[test]
    fn stale_instances_are_excluded() {
        let stats = VictronStats::default();
        // an update far in the past is stale
        let old = uptime::millis().wrapping_sub(STALE_MILLIS + 1_000).max(1);
        stats.update("A", instance("A", 300, 52_500, 340), old);

        assert_eq!(stats.output_power_watts(), None);
        assert!(stats.age_millis() > STALE_MILLIS);
    }
}
