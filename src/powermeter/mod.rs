//! AC grid power meter subsystem.
//!
//! A pluggable provider decodes meter readings into the shared data point
//! container; the controller owns the provider slot and exposes the readings
//! to the power limiter and the grid charger.

pub mod http_json;
pub mod mqtt;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, PowerMeterSource};
use crate::datapoints::DataPointContainer;
use crate::mqtt::MqttService;
use crate::uptime;

crate::data_point_labels! {
    pub enum Label: Value {
        PowerTotal(f32, "Power Total", "W"),
        PowerL1(f32, "Power L1", "W"),
        PowerL2(f32, "Power L2", "W"),
        PowerL3(f32, "Power L3", "W"),
    }
}

pub type SharedDataPoints = Arc<Mutex<DataPointContainer<Label>>>;

/// A meter reading older than this is stale and must not steer anything.
const DATA_VALID_MILLIS: u32 = 30 * 1000;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Prepare the provider. An error leaves the provider slot empty and the
    /// subsystem inert.
    async fn init(&mut self) -> anyhow::Result<()>;

    async fn deinit(&mut self);

    /// Periodic work; a no-op for event-driven providers.
    async fn tick(&mut self) {}

    fn data(&self) -> &SharedDataPoints;

    fn power_total(&self) -> f32 {
        let data = self.data().lock();
        if let Some(total) = data.get::<PowerTotal>() {
            return total;
        }
        data.get::<PowerL1>().unwrap_or(0.0)
            + data.get::<PowerL2>().unwrap_or(0.0)
            + data.get::<PowerL3>().unwrap_or(0.0)
    }

    fn last_update(&self) -> u32 {
        self.data().lock().last_update_now()
    }

    fn is_data_valid(&self) -> bool {
        let last_update = self.last_update();
        last_update > 0 && uptime::elapsed(uptime::millis(), last_update) < DATA_VALID_MILLIS
    }
}

/// Grid meter interface as seen by its consumers (power limiter, grid
/// charger).
#[async_trait]
pub trait GridMeter: Send + Sync {
    async fn power_total(&self) -> f32;
    async fn last_update(&self) -> u32;
    async fn is_data_valid(&self) -> bool;
}

pub struct Controller {
    config: Arc<parking_lot::RwLock<Config>>,
    mqtt: Arc<MqttService>,
    provider: tokio::sync::Mutex<Option<Box<dyn Provider>>>,
    last_publish: AtomicU32,
}

impl Controller {
    pub fn new(config: Arc<parking_lot::RwLock<Config>>, mqtt: Arc<MqttService>) -> Self {
        Self {
            config,
            mqtt,
            provider: tokio::sync::Mutex::new(None),
            last_publish: AtomicU32::new(0),
        }
    }

    /// Tear down the current provider (if any) and construct the configured
    /// one. Init failure leaves the slot empty.
    pub async fn update_settings(&self) {
        let mut slot = self.provider.lock().await;

        if let Some(mut old) = slot.take() {
            old.deinit().await;
        }

        let meter_config = {
            let config = self.config.read();
            if !config.power_meter.enabled {
                return;
            }
            config.power_meter.clone()
        };

        let mut provider: Box<dyn Provider> = match meter_config.source {
            PowerMeterSource::Mqtt => Box::new(mqtt::MqttProvider::new(
                meter_config.mqtt.clone(),
                Arc::clone(&self.mqtt),
            )),
            PowerMeterSource::HttpJson => {
                Box::new(http_json::HttpJsonProvider::new(meter_config.http_json.clone()))
            }
        };

        match provider.init().await {
            Ok(()) => {
                info!(source = ?meter_config.source, "power meter provider ready");
                *slot = Some(provider);
            }
            Err(e) => warn!(error = %e, "power meter provider init failed"),
        }
    }

    pub async fn tick(&self) {
        let mut slot = self.provider.lock().await;
        let Some(provider) = slot.as_mut() else { return };

        provider.tick().await;

        let (publish_interval, is_mqtt_source) = {
            let config = self.config.read();
            (
                config.mqtt.publish_interval_secs as u32 * 1000,
                config.power_meter.source == PowerMeterSource::Mqtt,
            )
        };

        // data received from MQTT does not need republishing
        if is_mqtt_source || !self.mqtt.is_connected() || !provider.is_data_valid() {
            return;
        }

        let now = uptime::millis();
        if uptime::elapsed(now, self.last_publish.load(Ordering::Relaxed)) < publish_interval {
            return;
        }
        self.last_publish.store(now, Ordering::Relaxed);

        let power_total = provider.power_total();
        let phases = {
            let data = provider.data().lock();
            [
                data.get::<PowerL1>(),
                data.get::<PowerL2>(),
                data.get::<PowerL3>(),
            ]
        };

        self.mqtt
            .publish("powermeter/powertotal", power_total.to_string())
            .await;
        for (index, value) in phases.iter().enumerate() {
            if let Some(value) = value {
                self.mqtt
                    .publish(&format!("powermeter/power{}", index + 1), value.to_string())
                    .await;
            }
        }
    }

    pub async fn power_total(&self) -> f32 {
        let slot = self.provider.lock().await;
        slot.as_ref().map(|p| p.power_total()).unwrap_or(0.0)
    }

    pub async fn last_update(&self) -> u32 {
        let slot = self.provider.lock().await;
        slot.as_ref().map(|p| p.last_update()).unwrap_or(0)
    }

    pub async fn is_data_valid(&self) -> bool {
        let slot = self.provider.lock().await;
        slot.as_ref().map(|p| p.is_data_valid()).unwrap_or(false)
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => controller.tick().await,
                }
            }
        });
    }
}

#[async_trait]
impl GridMeter for Controller {
    async fn power_total(&self) -> f32 {
        Controller::power_total(self).await
    }

    async fn last_update(&self) -> u32 {
        Controller::last_update(self).await
    }

    async fn is_data_valid(&self) -> bool {
        Controller::is_data_valid(self).await
    }
}
