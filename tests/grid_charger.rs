//! Grid charger control plane against a simulated rectifier on the CAN bus.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use open_microgrid_controller::battery::{Battery, BatteryStats, SharedStats};
use open_microgrid_controller::config::{Config, HardwareMode};
use open_microgrid_controller::gridcharger::hardware::encode_status_response;
use open_microgrid_controller::gridcharger::{Controller, GridCharger};
use open_microgrid_controller::hardware::factory::TransportFactory;
use open_microgrid_controller::hardware::{CanFrame, SimulatedCanBus};
use open_microgrid_controller::mqtt::MqttService;
use open_microgrid_controller::powermeter::GridMeter;
use open_microgrid_controller::uptime;

const PARAMETER_WRITE_ID: u32 = 0x108180FE;
const ONLINE_CURRENT: u8 = 3;

struct StubBattery {
    stats: SharedStats,
}

impl StubBattery {
    fn new() -> Arc<Self> {
        Arc::new(Self { stats: BatteryStats::new_shared() })
    }

    fn set_immediate_charging_request(&self, request: bool) {
        self.stats
            .write()
            .set_charge_flags(true, true, request, uptime::millis().max(1));
    }
}

#[async_trait]
impl Battery for StubBattery {
    async fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    async fn discharge_current_limit(&self) -> f32 {
        f32::MAX
    }
}

struct StubMeter {
    power: Mutex<f32>,
    sequence: AtomicU32,
}

impl StubMeter {
    fn new(power: f32) -> Arc<Self> {
        Arc::new(Self { power: Mutex::new(power), sequence: AtomicU32::new(0) })
    }
}

#[async_trait]
impl GridMeter for StubMeter {
    async fn power_total(&self) -> f32 {
        *self.power.lock()
    }

    async fn last_update(&self) -> u32 {
        // a new reading for every query
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn is_data_valid(&self) -> bool {
        true
    }
}

struct Rig {
    controller: Arc<Controller>,
    battery: Arc<StubBattery>,
    bus: SimulatedCanBus,
}

async fn rig(configure: impl FnOnce(&mut Config), meter_power: f32) -> Rig {
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut config = Config::default();
    config.grid_charger.enabled = true;
    config.grid_charger.upper_power_limit = 1500.0;
    config.grid_charger.lower_power_limit = 150.0;
    configure(&mut config);
    let config = Arc::new(parking_lot::RwLock::new(config));

    let factory = TransportFactory::new(HardwareMode::Simulated);
    let battery = StubBattery::new();
    let meter = StubMeter::new(meter_power);
    let (_producing_tx, producing_rx) = tokio::sync::watch::channel(false);

    let controller = Arc::new(Controller::new(
        config,
        MqttService::disabled(),
        Arc::clone(&factory),
        Arc::clone(&battery) as Arc<dyn Battery>,
        Arc::clone(&meter) as Arc<dyn GridMeter>,
        producing_rx,
    ));

    controller.update_settings().await;
    let bus = factory.grid_charger_bus_handle().expect("simulated bus");

    Rig { controller, battery, bus }
}

/// Feed a rectifier status set and let the bus task decode it.
async fn feed_status(
    rig: &Rig,
    output_voltage: f32,
    efficiency: f32,
    output_current: f32,
    output_power: f32,
) {
    rig.bus
        .inject(encode_status_response(0x75, (output_voltage * 1024.0) as u32));
    rig.bus
        .inject(encode_status_response(0x74, (efficiency * 1024.0) as u32));
    rig.bus
        .inject(encode_status_response(0x81, (output_current * 1024.0) as u32));
    rig.bus
        .inject(encode_status_response(0x73, (output_power * 1024.0) as u32));

    // wake the bus task and give it a moment to decode
    rig.controller.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Outbound command frames need a moment to pass through the bus task.
async fn flushed_writes(rig: &Rig) -> Vec<CanFrame> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.bus.drain_sent()
}

fn online_current_writes(frames: &[CanFrame]) -> Vec<u16> {
    frames
        .iter()
        .filter(|frame| frame.identifier == PARAMETER_WRITE_ID && frame.data[1] == ONLINE_CURRENT)
        .map(|frame| ((frame.data[6] as u16) << 8) | frame.data[7] as u16)
        .collect()
}

#[tokio::test]
async fn emergency_charge_overrides_everything() {
    let rig = rig(
        |config| {
            config.grid_charger.emergency_charge_enabled = true;
            config.grid_charger.auto_power_enabled = true;
        },
        0.0,
    )
    .await;

    feed_status(&rig, 52.0, 0.93, 0.0, 0.0).await;
    rig.bus.drain_sent();

    rig.battery.set_immediate_charging_request(true);
    rig.controller.tick().await;

    // I = eta * upper / V = 0.93 * 1500 / 52 = 26.83 A, scaled by 20
    let writes = online_current_writes(&flushed_writes(&rig).await);
    let value = *writes.last().expect("emergency current set");
    assert!((530..=540).contains(&value), "got {value}");

    // charging in an automatic mode powers the PSU up
    assert!(rig.controller.is_output_enabled().await);

    // the rectifier follows; the request is still asserted
    feed_status(&rig, 52.0, 0.93, 5.0, 260.0).await;
    rig.bus.drain_sent();

    // request clears, but the output current is still high: command zero
    // and stay in the emergency state
    rig.battery.set_immediate_charging_request(false);
    rig.controller.tick().await;
    let writes = online_current_writes(&flushed_writes(&rig).await);
    assert_eq!(writes.last(), Some(&0));

    // only below 1 A does normal control re-arm
    feed_status(&rig, 52.0, 0.93, 0.5, 26.0).await;
    rig.controller.tick().await;
    rig.bus.drain_sent();

    // past this point the autonomous loop finds nothing worth charging
    // with: at most zero-current commands go out
    rig.controller.tick().await;
    let writes = online_current_writes(&flushed_writes(&rig).await);
    assert!(writes.iter().all(|value| *value == 0), "got {writes:?}");
}

#[tokio::test]
async fn autonomous_mode_steers_toward_target_consumption() {
    let rig = rig(
        |config| {
            config.grid_charger.auto_power_enabled = true;
            config.grid_charger.target_power_consumption = 0.0;
            // output voltage below this threshold re-arms the control loop
            config.grid_charger.enable_voltage_limit = 53.0;
        },
        -100.0, // exporting 100 W
    )
    .await;

    feed_status(&rig, 52.0, 0.93, 5.0, 300.0).await;
    rig.bus.drain_sent();

    rig.controller.tick().await;

    // limit = 100 + 300 = 400 W; I = 0.93 * 400 / 52 = 7.15 A, scaled by 20
    let writes = online_current_writes(&flushed_writes(&rig).await);
    let value = *writes.last().expect("steering current set");
    assert!((140..=146).contains(&value), "got {value}");

    assert!(rig.controller.auto_power_status().await);

    // a freshly issued value blocks recalculation for output stabilization
    rig.controller.tick().await;
    let writes = online_current_writes(&flushed_writes(&rig).await);
    assert!(writes.is_empty());
}

#[tokio::test]
async fn producing_inverter_suspends_autonomous_charging() {
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut config = Config::default();
    config.grid_charger.enabled = true;
    config.grid_charger.auto_power_enabled = true;
    config.grid_charger.enable_voltage_limit = 53.0;
    let config = Arc::new(parking_lot::RwLock::new(config));

    let factory = TransportFactory::new(HardwareMode::Simulated);
    let battery = StubBattery::new();
    let meter = StubMeter::new(-100.0);
    let (producing_tx, producing_rx) = tokio::sync::watch::channel(true);

    let controller = Arc::new(Controller::new(
        config,
        MqttService::disabled(),
        Arc::clone(&factory),
        Arc::clone(&battery) as Arc<dyn Battery>,
        Arc::clone(&meter) as Arc<dyn GridMeter>,
        producing_rx,
    ));
    controller.update_settings().await;
    let bus = factory.grid_charger_bus_handle().unwrap();

    bus.inject(encode_status_response(0x75, (52.0 * 1024.0) as u32));
    bus.inject(encode_status_response(0x73, (300.0 * 1024.0) as u32));
    controller.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // an active battery-powered inverter forces the charger to zero
    let writes = online_current_writes(&bus.drain_sent());
    assert_eq!(writes.last(), Some(&0));
    assert!(!controller.auto_power_status().await);

    drop(producing_tx);
}
