//! Battery stats subscribed from MQTT topics (SoC, voltage, discharge
//! current limit), typically published by an external BMS bridge.
//!
//! Implausible readings are rejected at this boundary: SoC outside [0, 100],
//! voltage outside [0, 65] and negative current limits are logged and
//! discarded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::stats::{BatteryStats, SharedStats};
use super::Provider;
use crate::config::BatteryConfig;
use crate::mqtt::{numeric_from_payload, MqttService};
use crate::uptime;

pub struct MqttProvider {
    config: BatteryConfig,
    mqtt: Arc<MqttService>,
    stats: SharedStats,
    soc_precision: Arc<Mutex<u8>>,
    subscribed: Vec<String>,
}

impl MqttProvider {
    pub fn new(config: BatteryConfig, mqtt: Arc<MqttService>) -> Self {
        Self {
            config,
            mqtt,
            stats: BatteryStats::new_shared(),
            soc_precision: Arc::new(Mutex::new(0)),
            subscribed: Vec::new(),
        }
    }

    /// Number of decimal places needed to render the value, capped at two.
    fn precision_for(value: f32) -> u8 {
        if (value - value.floor()).abs() < 1e-4 {
            0
        } else if (value * 10.0 - (value * 10.0).floor()).abs() < 1e-3 {
            1
        } else {
            2
        }
    }
}

#[async_trait]
impl Provider for MqttProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        self.stats.write().set_manufacturer("MQTT");

        let mqtt_config = self.config.mqtt.clone();

        anyhow::ensure!(
            !mqtt_config.soc_topic.is_empty() || !mqtt_config.voltage_topic.is_empty(),
            "neither SoC nor voltage topic configured"
        );

        if !mqtt_config.soc_topic.is_empty() {
            let stats = Arc::clone(&self.stats);
            let precision_seen = Arc::clone(&self.soc_precision);
            let json_path = mqtt_config.soc_json_path.clone();

            self.mqtt
                .subscribe(
                    &mqtt_config.soc_topic,
                    Arc::new(move |topic, payload| {
                        let soc = match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(soc) => soc,
                            Err(e) => {
                                warn!(topic, error = %e, "ignoring SoC payload");
                                return;
                            }
                        };

                        if !(0.0..=100.0).contains(&soc) {
                            warn!(topic, soc, "implausible SoC, discarded");
                            return;
                        }

                        let precision = {
                            let mut seen = precision_seen.lock();
                            *seen = (*seen).max(Self::precision_for(soc));
                            *seen
                        };

                        stats.write().set_soc(soc, precision, uptime::millis());
                        debug!(topic, soc, "battery SoC updated");
                    }),
                )
                .await;
            self.subscribed.push(mqtt_config.soc_topic.clone());
        }

        if !mqtt_config.voltage_topic.is_empty() {
            let stats = Arc::clone(&self.stats);
            let json_path = mqtt_config.voltage_json_path.clone();

            self.mqtt
                .subscribe(
                    &mqtt_config.voltage_topic,
                    Arc::new(move |topic, payload| {
                        let voltage = match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(voltage) => voltage,
                            Err(e) => {
                                warn!(topic, error = %e, "ignoring voltage payload");
                                return;
                            }
                        };

                        if !(0.0..=65.0).contains(&voltage) {
                            warn!(topic, voltage, "implausible voltage, discarded");
                            return;
                        }

                        stats.write().set_voltage(voltage, uptime::millis());
                        debug!(topic, voltage, "battery voltage updated");
                    }),
                )
                .await;
            self.subscribed.push(mqtt_config.voltage_topic.clone());
        }

        let limit_wanted = self.config.enable_discharge_current_limit
            && self.config.use_battery_reported_discharge_current_limit;
        if limit_wanted && !mqtt_config.discharge_current_limit_topic.is_empty() {
            let stats = Arc::clone(&self.stats);
            let json_path = mqtt_config.discharge_current_limit_json_path.clone();

            self.mqtt
                .subscribe(
                    &mqtt_config.discharge_current_limit_topic,
                    Arc::new(move |topic, payload| {
                        let limit = match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(limit) => limit,
                            Err(e) => {
                                warn!(topic, error = %e, "ignoring discharge limit payload");
                                return;
                            }
                        };

                        if limit < 0.0 {
                            warn!(topic, limit, "implausible discharge current limit, discarded");
                            return;
                        }

                        stats
                            .write()
                            .set_discharge_current_limit(limit, uptime::millis());
                        debug!(topic, limit, "battery discharge current limit updated");
                    }),
                )
                .await;
            self.subscribed
                .push(mqtt_config.discharge_current_limit_topic.clone());
        }

        Ok(())
    }

    async fn deinit(&mut self) {
        for topic in self.subscribed.drain(..) {
            self.mqtt.unsubscribe(&topic).await;
        }
    }

    fn stats(&self) -> &SharedStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(80.0, 0)]
    #[case(80.5, 1)]
    #[case(80.25, 2)]
    #[case(80.123, 2)]
    fn soc_precision_is_derived_from_value(#[case] soc: f32, #[case] expected: u8) {
        assert_eq!(MqttProvider::precision_for(soc), expected);
    }

    #[tokio::test]
    async fn init_requires_a_topic() {
        let mut provider = MqttProvider::new(BatteryConfig::default(), MqttService::disabled());
        assert!(provider.init().await.is_err());

        let mut config = BatteryConfig::default();
        config.mqtt.soc_topic = "bms/soc".to_string();
        let mut provider = MqttProvider::new(config, MqttService::disabled());
        assert!(provider.init().await.is_ok());
        assert_eq!(provider.stats().read().manufacturer(), Some("MQTT"));
    }
}
