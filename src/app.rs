//! Application state: the dependency container built once at boot.
//!
//! All controllers live here; providers receive handles to the container's
//! members instead of reaching for globals. Mutable state lives inside the
//! individual owners and is lock-guarded there.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::battery;
use crate::config::Config;
use crate::gridcharger;
use crate::hardware::factory::TransportFactory;
use crate::mqtt::MqttService;
use crate::powerlimiter::handle::{
    InverterRegistry, SimulatedInverterHandle, SimulatedInverterRegistry,
};
use crate::powerlimiter::PowerLimiter;
use crate::powermeter;
use crate::serial_ports::SerialPortAllocator;
use crate::solarcharger;
use crate::sun::SunPosition;

pub struct AppState {
    pub config: Arc<parking_lot::RwLock<Config>>,
    pub mqtt: Arc<MqttService>,
    pub serial_ports: Arc<SerialPortAllocator>,
    pub factory: Arc<TransportFactory>,
    pub battery: Arc<battery::Controller>,
    pub power_meter: Arc<powermeter::Controller>,
    pub solar_charger: Arc<solarcharger::Controller>,
    pub grid_charger: Arc<gridcharger::Controller>,
    pub power_limiter: Arc<PowerLimiter>,
    cancel: CancellationToken,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let config = Arc::new(parking_lot::RwLock::new(config));

        let mqtt = {
            let config = config.read();
            MqttService::new(&config.mqtt, cancel.child_token())
        };

        let serial_ports = Arc::new(SerialPortAllocator::new());
        let factory = {
            let config = config.read();
            TransportFactory::new(config.hardware.mode)
        };

        let battery = Arc::new(battery::Controller::new(
            Arc::clone(&config),
            Arc::clone(&mqtt),
            Arc::clone(&factory),
        ));

        let power_meter = Arc::new(powermeter::Controller::new(
            Arc::clone(&config),
            Arc::clone(&mqtt),
        ));

        let solar_charger = Arc::new(solarcharger::Controller::new(
            Arc::clone(&config),
            Arc::clone(&mqtt),
            Arc::clone(&factory),
            Arc::clone(&serial_ports),
        ));

        let (producing_tx, producing_rx) = watch::channel(false);

        let grid_charger = Arc::new(gridcharger::Controller::new(
            Arc::clone(&config),
            Arc::clone(&mqtt),
            Arc::clone(&factory),
            Arc::clone(&battery) as Arc<dyn battery::Battery>,
            Arc::clone(&power_meter) as Arc<dyn powermeter::GridMeter>,
            producing_rx,
        ));

        // every governed serial gets a simulated radio handle; a real radio
        // stack would register its handles in this registry instead
        let registry = SimulatedInverterRegistry::new();
        {
            let config = config.read();
            for inverter in &config.power_limiter.inverters {
                registry.add(SimulatedInverterHandle::new(inverter.serial));
            }
        }

        let sun = {
            let config = config.read();
            SunPosition::new(config.location.latitude, config.location.longitude)
        };

        let power_limiter = Arc::new(PowerLimiter::new(
            Arc::clone(&config),
            Arc::clone(&mqtt),
            Arc::clone(&battery) as Arc<dyn battery::Battery>,
            Arc::clone(&solar_charger) as Arc<dyn solarcharger::SolarCharger>,
            Arc::clone(&power_meter) as Arc<dyn powermeter::GridMeter>,
            Arc::clone(&grid_charger) as Arc<dyn gridcharger::GridCharger>,
            Arc::clone(&registry) as Arc<dyn InverterRegistry>,
            sun,
            producing_tx,
        ));

        battery.restore_history().await;
        battery.update_settings().await;
        power_meter.update_settings().await;
        solar_charger.update_settings().await;
        grid_charger.update_settings().await;
        grid_charger.subscribe_commands().await;
        power_limiter.subscribe_commands().await;

        Ok(Self {
            config,
            mqtt,
            serial_ports,
            factory,
            battery,
            power_meter,
            solar_charger,
            grid_charger,
            power_limiter,
            cancel,
        })
    }

    pub fn spawn_tasks(&self) {
        self.battery.spawn(self.cancel.child_token());
        self.power_meter.spawn(self.cancel.child_token());
        self.solar_charger.spawn(self.cancel.child_token());
        self.grid_charger.spawn(self.cancel.child_token());
        self.power_limiter.spawn(self.cancel.child_token());
    }

    /// Apply a changed configuration: every subsystem tears down and
    /// rebuilds its provider, the power limiter rebuilds its inverter set.
    pub async fn update_settings(&self) {
        self.battery.update_settings().await;
        self.power_meter.update_settings().await;
        self.solar_charger.update_settings().await;
        self.grid_charger.update_settings().await;
        self.power_limiter.trigger_reload();
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
