//! Solar charge controller subsystem.
//!
//! Aggregated views over one or more MPPT charge controllers. The power
//! limiter consumes the aggregate output power (solar passthrough) and the
//! aggregate output voltage (battery voltage fallback).

pub mod mqtt;
pub mod victron;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, SolarChargerProvider as ProviderKind};
use crate::hardware::factory::TransportFactory;
use crate::mqtt::MqttService;
use crate::serial_ports::SerialPortAllocator;
use crate::uptime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOfOperation {
    Off,
    Bulk,
    Absorption,
    Float,
    Various,
}

/// Aggregate view over all charge controller instances. Instances whose data
/// is older than 10 s are excluded from every aggregation.
pub trait Stats: Send + Sync {
    /// Age of the oldest instance's data; a stalled instance holds the
    /// aggregate back.
    fn age_millis(&self) -> u32;

    /// Total output (battery-side) power of all instances in watts.
    fn output_power_watts(&self) -> Option<f32>;

    /// Minimum of all instances' output voltages in volts.
    fn output_voltage(&self) -> Option<f32>;

    /// Total panel input power in watts.
    fn panel_power_watts(&self) -> Option<f32>;

    /// Sum of all instances' total yields in kWh.
    fn yield_total_kwh(&self) -> Option<f32>;

    /// Sum of today's yields in Wh.
    fn yield_day_wh(&self) -> Option<f32>;

    fn state_of_operation(&self) -> Option<StateOfOperation> {
        None
    }

    fn absorption_voltage(&self) -> Option<f32> {
        None
    }

    fn float_voltage(&self) -> Option<f32> {
        None
    }
}

/// Stats standing in while no provider is configured; every getter is empty.
pub struct DummyStats;

impl Stats for DummyStats {
    fn age_millis(&self) -> u32 {
        0
    }

    fn output_power_watts(&self) -> Option<f32> {
        None
    }

    fn output_voltage(&self) -> Option<f32> {
        None
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

#[async_trait]
pub trait Provider: Send + Sync {
    async fn init(&mut self) -> anyhow::Result<()>;
    async fn deinit(&mut self);
    async fn tick(&mut self) {}
    fn stats(&self) -> Arc<dyn Stats>;
}

/// Solar charger interface as seen by the power limiter.
#[async_trait]
pub trait SolarCharger: Send + Sync {
    async fn stats(&self) -> Arc<dyn Stats>;
}

pub struct Controller {
    config: Arc<parking_lot::RwLock<Config>>,
    mqtt: Arc<MqttService>,
    factory: Arc<TransportFactory>,
    serial_ports: Arc<SerialPortAllocator>,
    provider: tokio::sync::Mutex<Option<Box<dyn Provider>>>,
    last_publish: AtomicU32,
}

impl Controller {
    pub fn new(
        config: Arc<parking_lot::RwLock<Config>>,
        mqtt: Arc<MqttService>,
        factory: Arc<TransportFactory>,
        serial_ports: Arc<SerialPortAllocator>,
    ) -> Self {
        Self {
            config,
            mqtt,
            factory,
            serial_ports,
            provider: tokio::sync::Mutex::new(None),
            last_publish: AtomicU32::new(0),
        }
    }

    pub async fn update_settings(&self) {
        let mut slot = self.provider.lock().await;

        if let Some(mut old) = slot.take() {
            old.deinit().await;
        }

        let charger_config = {
            let config = self.config.read();
            if !config.solar_charger.enabled {
                return;
            }
            config.solar_charger.clone()
        };

        let mut provider: Box<dyn Provider> = match charger_config.provider {
            ProviderKind::VictronMppt => Box::new(victron::VictronProvider::new(
                charger_config.victron_instances,
                Arc::clone(&self.serial_ports),
                Arc::clone(&self.factory),
            )),
            ProviderKind::Mqtt => Box::new(mqtt::MqttProvider::new(
                charger_config.mqtt.clone(),
                Arc::clone(&self.mqtt),
            )),
        };

        match provider.init().await {
            Ok(()) => {
                info!(provider = ?charger_config.provider, "solar charger provider ready");
                *slot = Some(provider);
            }
            Err(e) => warn!(error = %e, "solar charger provider init failed"),
        }
    }

    /// Aggregate stats; all getters empty while no provider runs.
    pub async fn stats(&self) -> Arc<dyn Stats> {
        let slot = self.provider.lock().await;
        match slot.as_ref() {
            Some(provider) => provider.stats(),
            None => Arc::new(DummyStats),
        }
    }

    pub async fn tick(&self) {
        let mut slot = self.provider.lock().await;
        let Some(provider) = slot.as_mut() else { return };

        provider.tick().await;
        let stats = provider.stats();
        drop(slot);

        self.publish_stats(stats.as_ref()).await;
    }

    async fn publish_stats(&self, stats: &dyn Stats) {
        let (publish_interval, is_mqtt_source) = {
            let config = self.config.read();
            (
                config.mqtt.publish_interval_secs as u32 * 1000,
                config.solar_charger.provider == ProviderKind::Mqtt,
            )
        };

        if is_mqtt_source || !self.mqtt.is_connected() {
            return;
        }

        let now = uptime::millis();
        if uptime::elapsed(now, self.last_publish.load(Ordering::Relaxed)) < publish_interval {
            return;
        }
        self.last_publish.store(now, Ordering::Relaxed);

        if let Some(power) = stats.output_power_watts() {
            self.mqtt
                .publish("solarcharger/power", power.to_string())
                .await;
        }
        if let Some(voltage) = stats.output_voltage() {
            self.mqtt
                .publish("solarcharger/voltage", voltage.to_string())
                .await;
        }
        if let Some(panel) = stats.panel_power_watts() {
            self.mqtt
                .publish("solarcharger/panelPower", panel.to_string())
                .await;
        }
        if let Some(yield_total) = stats.yield_total_kwh() {
            self.mqtt
                .publish("solarcharger/yieldTotal", yield_total.to_string())
                .await;
        }
        if let Some(yield_day) = stats.yield_day_wh() {
            self.mqtt
                .publish("solarcharger/yieldDay", yield_day.to_string())
                .await;
        }
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
impl SolarCharger for Controller {
    async fn stats(&self) -> Arc<dyn Stats> {
        Controller::stats(self).await
    }
}
