//! Pylontech battery stats decoded from the BMS CAN broadcast.
//!
//! The BMS periodically broadcasts its state on the 500 kbit/s bus; this
//! provider drains the receive queue on every tick and updates the shared
//! stats. All multi-byte quantities are little-endian.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use tracing::{debug, trace};

use super::stats::{BatteryStats, IssueFlags, SharedStats};
use super::Provider;
use crate::hardware::{CanFrame, CanInterface};
use crate::uptime;

const ID_LIMITS: u32 = 0x351;
const ID_STATE_OF_CHARGE: u32 = 0x355;
const ID_MEASUREMENTS: u32 = 0x356;
const ID_ISSUES: u32 = 0x359;
const ID_CHARGE_FLAGS: u32 = 0x35C;
const ID_MANUFACTURER: u32 = 0x35E;

pub struct PylontechCanProvider {
    bus: Arc<dyn CanInterface>,
    stats: SharedStats,
}

impl PylontechCanProvider {
    pub fn new(bus: Arc<dyn CanInterface>) -> Self {
        Self {
            bus,
            stats: BatteryStats::new_shared(),
        }
    }

    fn on_message(&self, frame: CanFrame) {
        trace!(identifier = format_args!("{:#05X}", frame.identifier), "battery CAN frame");

        let data = &frame.data;
        let now = uptime::millis();
        let mut stats = self.stats.write();

        match frame.identifier {
            ID_LIMITS => {
                let charge_voltage = LittleEndian::read_u16(&data[0..2]) as f32 * 0.1;
                let charge_current_limit = LittleEndian::read_i16(&data[2..4]) as f32 * 0.1;
                let discharge_current_limit = LittleEndian::read_i16(&data[4..6]) as f32 * 0.1;

                stats.set_charge_voltage(charge_voltage, now);
                stats.set_charge_current_limit(charge_current_limit, now);
                stats.set_discharge_current_limit(discharge_current_limit, now);
                debug!(
                    charge_voltage,
                    charge_current_limit, discharge_current_limit, "battery limits updated"
                );
            }
            ID_STATE_OF_CHARGE => {
                let soc = LittleEndian::read_u16(&data[0..2]) as f32;
                let soh = LittleEndian::read_u16(&data[2..4]) as f32;

                stats.set_soc(soc, 0, now);
                stats.set_state_of_health(soh, now);
            }
            ID_MEASUREMENTS => {
                let voltage = LittleEndian::read_i16(&data[0..2]) as f32 * 0.01;
                let current = LittleEndian::read_i16(&data[2..4]) as f32 * 0.1;
                let temperature = LittleEndian::read_i16(&data[4..6]) as f32 * 0.1;

                stats.set_voltage(voltage, now);
                stats.set_current(current, 1, now);
                stats.set_temperature(temperature, now);
            }
            ID_ISSUES => {
                let alarms = IssueFlags {
                    over_current_discharge: bit(data[0], 7),
                    under_temperature: bit(data[0], 4),
                    over_temperature: bit(data[0], 3),
                    under_voltage: bit(data[0], 2),
                    over_voltage: bit(data[0], 1),
                    over_current_charge: bit(data[1], 0),
                    bms_internal: bit(data[1], 3),
                };
                let warnings = IssueFlags {
                    over_current_discharge: bit(data[2], 7),
                    under_temperature: bit(data[2], 4),
                    over_temperature: bit(data[2], 3),
                    under_voltage: bit(data[2], 2),
                    over_voltage: bit(data[2], 1),
                    over_current_charge: bit(data[3], 0),
                    bms_internal: bit(data[3], 3),
                };

                stats.set_issues(alarms, warnings, now);
                stats.set_module_count(data[4]);
            }
            ID_CHARGE_FLAGS => {
                let charge_enabled = bit(data[0], 7);
                let discharge_enabled = bit(data[0], 6);
                let charge_immediately = bit(data[0], 5);

                stats.set_charge_flags(charge_enabled, discharge_enabled, charge_immediately, now);
            }
            ID_MANUFACTURER => {
                let text: String = data[..frame.dlc.min(8) as usize]
                    .iter()
                    .take_while(|&&byte| byte != 0)
                    .map(|&byte| byte as char)
                    .collect();
                if !text.is_empty() {
                    stats.set_manufacturer(&text);
                }
            }
            _ => {}
        }
    }
}

fn bit(value: u8, bit: u8) -> bool {
    (value >> bit) & 1 != 0
}

#[async_trait]
impl Provider for PylontechCanProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deinit(&mut self) {}

    async fn tick(&mut self) {
        while let Some(frame) = self.bus.try_receive() {
            self.on_message(frame);
        }
    }

    fn stats(&self) -> &SharedStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedCanBus;

    async fn provider_with(frames: &[CanFrame]) -> PylontechCanProvider {
        let bus = SimulatedCanBus::new();
        for frame in frames {
            bus.inject(*frame);
        }
        let mut provider = PylontechCanProvider::new(Arc::new(bus));
        provider.init().await.unwrap();
        provider.tick().await;
        provider
    }

    #[tokio::test]
    async fn decodes_limits_frame() {
        // 53.2 V charge voltage, 100.0 A charge limit, 80.0 A discharge limit
        let mut data = [0u8; 8];
        LittleEndian::write_u16(&mut data[0..2], 532);
        LittleEndian::write_i16(&mut data[2..4], 1000);
        LittleEndian::write_i16(&mut data[4..6], 800);

        let provider = provider_with(&[CanFrame::new(ID_LIMITS, data)]).await;
        let stats = provider.stats().read();

        assert!((stats.charge_voltage().unwrap() - 53.2).abs() < 0.01);
        assert!((stats.charge_current_limit() - 100.0).abs() < 0.01);
        assert!((stats.discharge_current_limit() - 80.0).abs() < 0.01);
        assert!(stats.is_discharge_current_limit_valid());
    }

    #[tokio::test]
    async fn decodes_soc_and_measurements() {
        let mut soc_data = [0u8; 8];
        LittleEndian::write_u16(&mut soc_data[0..2], 77);
        LittleEndian::write_u16(&mut soc_data[2..4], 99);

        let mut meas_data = [0u8; 8];
        LittleEndian::write_i16(&mut meas_data[0..2], 5124); // 51.24 V
        LittleEndian::write_i16(&mut meas_data[2..4], -125); // -12.5 A
        LittleEndian::write_i16(&mut meas_data[4..6], 231); // 23.1 degC

        let provider = provider_with(&[
            CanFrame::new(ID_STATE_OF_CHARGE, soc_data),
            CanFrame::new(ID_MEASUREMENTS, meas_data),
        ])
        .await;
        let stats = provider.stats().read();

        assert_eq!(stats.soc(), 77.0);
        assert_eq!(stats.state_of_health(), Some(99.0));
        assert!((stats.voltage() - 51.24).abs() < 0.01);
        assert!((stats.charge_current() + 12.5).abs() < 0.01);
        assert!((stats.temperature().unwrap() - 23.1).abs() < 0.01);
    }

    #[tokio::test]
    async fn charge_immediately_flag_raises_request() {
        let mut data = [0u8; 8];
        data[0] = 1 << 7 | 1 << 5; // charge enabled + charge immediately

        let provider = provider_with(&[CanFrame::new(ID_CHARGE_FLAGS, data)]).await;
        let stats = provider.stats().read();

        assert!(stats.charge_enabled());
        assert!(!stats.discharge_enabled());
        assert!(stats.immediate_charging_request());
    }

    #[tokio::test]
    async fn decodes_manufacturer() {
        let mut data = [0u8; 8];
        data[..7].copy_from_slice(b"PYLONTE");

        let provider = provider_with(&[CanFrame::new(ID_MANUFACTURER, data)]).await;
        assert_eq!(provider.stats().read().manufacturer(), Some("PYLONTE"));
    }

    #[tokio::test]
    async fn unknown_frames_are_ignored() {
        let provider = provider_with(&[CanFrame::new(0x7FF, [0xFF; 8])]).await;
        assert!(!provider.stats().read().is_soc_valid());
    }
}
