//! Power meter readings subscribed from MQTT topics.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Provider, SharedDataPoints};
use crate::config::PowerMeterMqttConfig;
use crate::datapoints::DataPointContainer;
use crate::mqtt::{numeric_from_payload, MqttService};

pub struct MqttProvider {
    config: PowerMeterMqttConfig,
    mqtt: Arc<MqttService>,
    data: SharedDataPoints,
    subscribed: Vec<String>,
}

impl MqttProvider {
    pub fn new(config: PowerMeterMqttConfig, mqtt: Arc<MqttService>) -> Self {
        Self {
            config,
            mqtt,
            data: Arc::new(Mutex::new(DataPointContainer::new())),
            subscribed: Vec::new(),
        }
    }

    fn store_phase(data: &SharedDataPoints, phase: usize, value: f32) {
        let mut data = data.lock();
        match phase {
            0 => data.add::<super::PowerL1>(value),
            1 => data.add::<super::PowerL2>(value),
            2 => data.add::<super::PowerL3>(value),
            _ => {}
        }
    }
}

#[async_trait]
impl Provider for MqttProvider {
    async fn init(&mut self) -> anyhow::Result<()> {
        let values: Vec<_> = self
            .config
            .values
            .iter()
            .take(3)
            .cloned()
            .enumerate()
            .filter(|(_, value)| !value.topic.is_empty())
            .collect();

        anyhow::ensure!(!values.is_empty(), "no power meter topics configured");

        for (phase, value) in values {
            let data = Arc::clone(&self.data);
            let json_path = value.json_path.clone();
            let unit = value.unit;
            let sign_inverted = value.sign_inverted;

            self.mqtt
                .subscribe(
                    &value.topic,
                    Arc::new(move |topic, payload| {
                        match numeric_from_payload(payload, json_path.as_deref()) {
                            Ok(raw) => {
                                let mut watts = unit.to_watts(raw);
                                if sign_inverted {
                                    watts = -watts;
                                }
                                Self::store_phase(&data, phase, watts);
                                debug!(topic, watts, "power meter reading updated");
                            }
                            Err(e) => {
                                warn!(topic, error = %e, "ignoring power meter payload")
                            }
                        }
                    }),
                )
                .await;

            self.subscribed.push(value.topic);
        }

        Ok(())
    }

    async fn deinit(&mut self) {
        for topic in self.subscribed.drain(..) {
            self.mqtt.unsubscribe(&topic).await;
        }
    }

    fn data(&self) -> &SharedDataPoints {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PowerMeterMqttValue, PowerUnit};
    use crate::mqtt::MqttService;

    fn provider_with_values(values: Vec<PowerMeterMqttValue>) -> MqttProvider {
        MqttProvider::new(PowerMeterMqttConfig { values }, MqttService::disabled())
    }

    #[tokio::test]
    async fn init_requires_at_least_one_topic() {
        let mut provider = provider_with_values(vec![]);
        assert!(provider.init().await.is_err());

        let mut provider = provider_with_values(vec![PowerMeterMqttValue {
            topic: "meter/power".to_string(),
            ..Default::default()
        }]);
        assert!(provider.init().await.is_ok());
    }

    #[tokio::test]
    async fn phases_sum_into_power_total() {
        let provider = provider_with_values(vec![]);
        MqttProvider::store_phase(provider.data(), 0, 100.0);
        MqttProvider::store_phase(provider.data(), 1, 150.0);
        MqttProvider::store_phase(provider.data(), 2, -30.0);

        assert_eq!(provider.power_total(), 220.0);
        assert!(provider.is_data_valid());
    }

    #[tokio::test]
    async fn unit_conversion_applies_at_ingest() {
        assert_eq!(PowerUnit::KiloWatts.to_watts(0.5), 500.0);
    }
}
