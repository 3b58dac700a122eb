//! Solar charger readings subscribed from MQTT topics, for charge
//! controllers integrated through an external bridge.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Provider, Stats};
use crate::config::SolarChargerMqttConfig;
use crate::mqtt::{numeric_from_payload, MqttService};
use crate::uptime;

const STALE_MILLIS: u32 = 10 * 1000;

#[derive(Debug, Default)]
struct Readings {
    output_power_w: Option<(f32, u32)>,
    output_voltage_v: Option<(f32, u32)>,
}

#[derive(Default)]
pub struct MqttStats {
    readings: Mutex<Readings>,
}

impl MqttStats {
    fn fresh(value: Option<(f32, u32)>, now: u32) -> Option<f32> {
        value
            .filter(|(_, at)| *at > 0 && uptime::elapsed(now, *at) <= STALE_MILLIS)
            .map(|(value, _)| value)
    }
}

impl Stats for MqttStats {
    fn age_millis(&self) -> u32 {
        let now = uptime::millis();
        let readings = self.readings.lock();

        let mut age = 0;
        for at in [readings.output_power_w, readings.output_voltage_v]
            .iter()
            .flatten()
            .map(|(_, at)| *at)
        {
            if at > 0 {
                age = age.max(uptime::elapsed(now, at));
            }
        }
        age
    }

    fn output_power_watts(&self) -> Option<f32> {
        let now = uptime::millis();
        Self::fresh(self.readings.lock().output_power_w, now)
    }

    fn output_voltage(&self) -> Option<f32> {
        let now = uptime::millis();
        Self::fresh(self.readings.lock().output_voltage_v, now)
    }

    fn panel_power_watts(&self) -> Option<f32> {
        None
    }

    fn yield_total_kwh(&self) -> Option<f32> {
        None
    }

    fn yield_day_wh(&self) -> Option<f32> {
        None
    }
}

pub struct MqttProvider {
    config: SolarChargerMqttConfig,
    mqtt: Arc<MqttService>,
    stats: Arc<MqttStats>,
    subscribed: Vec<String>,
}

impl MqttProvider {
    pub fn new(config: SolarChargerMqttConfig, mqtt: Arc<MqttService>) -> Self {
        Self {
            config,
            mqtt,
            stats: Arc::new(MqttStats::default()),
            subscribed: Vec::new(),
        }
    }
}

#[async_trait]
impl Provider for MqttProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.config.power_topic.is_empty(),
            "no solar charger power topic configured"
        );

        {
            let stats = Arc::clone(&self.stats);
            let json_path = self.config.power_json_path.clone();
            let unit = self.config.power_unit;

            self.mqtt
                .subscribe(
                    &self.config.power_topic,
                    Arc::new(move |topic, payload| {
                        match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(raw) => {
                                let watts = unit.to_watts(raw);
                                stats.readings.lock().output_power_w =
                                    Some((watts, uptime::millis()));
                                debug!(topic, watts, "solar charger output power updated");
                            }
                            Err(e) => warn!(topic, error = %e, "ignoring output power payload"),
                        }
                    }),
                )
                .await;
            self.subscribed.push(self.config.power_topic.clone());
        }

        if !self.config.voltage_topic.is_empty() {
            let stats = Arc::clone(&self.stats);
            let json_path = self.config.voltage_json_path.clone();

            self.mqtt
                .subscribe(
                    &self.config.voltage_topic,
                    Arc::new(move |topic, payload| {
                        match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(voltage) => {
                                if !(0.0..=65.0).contains(&voltage) {
                                    warn!(topic, voltage, "implausible voltage, discarded");
                                    return;
                                }
                                stats.readings.lock().output_voltage_v =
                                    Some((voltage, uptime::millis()));
                            }
                            Err(e) => warn!(topic, error = %e, "ignoring voltage payload"),
                        }
                    }),
                )
                .await;
            self.subscribed.push(self.config.voltage_topic.clone());
        }

        Ok(())
    }

    async fn deinit(&mut self) {
        for topic in self.subscribed.drain(..) {
            self.mqtt.unsubscribe(&topic).await;
        }
    }

    fn stats(&self) -> Arc<dyn Stats> {
        Arc::clone(&self.stats) as Arc<dyn Stats>
    }
}
