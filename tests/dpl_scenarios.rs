//! End-to-end power limiter scenarios against fully simulated devices.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use open_microgrid_controller::battery::{Battery, BatteryStats, SharedStats};
use open_microgrid_controller::config::{
    Config, InverterPowerSource, PowerLimiterInverterConfig,
};
use open_microgrid_controller::gridcharger::GridCharger;
use open_microgrid_controller::mqtt::MqttService;
use open_microgrid_controller::powerlimiter::handle::{
    InverterHandle, InverterRegistry, SimulatedInverterHandle, SimulatedInverterRegistry,
};
use open_microgrid_controller::powerlimiter::{PowerLimiter, UiState};
use open_microgrid_controller::powermeter::GridMeter;
use open_microgrid_controller::solarcharger::{SolarCharger, Stats};
use open_microgrid_controller::sun::SunPosition;
use open_microgrid_controller::uptime;

const SERIAL: u64 = 0x1164_0000_0001;

struct StubBattery {
    stats: SharedStats,
    discharge_limit: Mutex<f32>,
}

impl StubBattery {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stats: BatteryStats::new_shared(),
            discharge_limit: Mutex::new(f32::MAX),
        })
    }

    fn set_soc(&self, soc: f32) {
        self.stats.write().set_soc(soc, 0, uptime::millis().max(1));
    }
}

#[async_trait]
impl Battery for StubBattery {
    async fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    async fn discharge_current_limit(&self) -> f32 {
        *self.discharge_limit.lock()
    }
}

struct StubMeter {
    power: Mutex<f32>,
    valid: AtomicBool,
}

impl StubMeter {
    fn new(power: f32) -> Arc<Self> {
        Arc::new(Self { power: Mutex::new(power), valid: AtomicBool::new(true) })
    }
}

#[async_trait]
impl GridMeter for StubMeter {
    async fn power_total(&self) -> f32 {
        *self.power.lock()
    }

    async fn last_update(&self) -> u32 {
        // always sufficiently newer than any inverter stats
        uptime::millis().wrapping_add(5000)
    }

    async fn is_data_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }
}

struct StubSolarStats {
    output_power: Mutex<Option<f32>>,
}

impl Stats for StubSolarStats {
    fn age_millis(&self) -> u32 {
        0
    }

    fn output_power_watts(&self) -> Option<f32> {
        *self.output_power.lock()
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

struct StubSolarCharger {
    stats: Arc<StubSolarStats>,
}

impl StubSolarCharger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stats: Arc::new(StubSolarStats { output_power: Mutex::new(None) }),
        })
    }
}

#[async_trait]
impl SolarCharger for StubSolarCharger {
    async fn stats(&self) -> Arc<dyn Stats> {
        Arc::clone(&self.stats) as Arc<dyn Stats>
    }
}

struct StubGridCharger {
    auto_power: AtomicBool,
}

impl StubGridCharger {
    fn new() -> Arc<Self> {
        Arc::new(Self { auto_power: AtomicBool::new(false) })
    }
}

#[async_trait]
impl GridCharger for StubGridCharger {
    async fn auto_power_status(&self) -> bool {
        self.auto_power.load(Ordering::Relaxed)
    }
}

struct Rig {
    limiter: Arc<PowerLimiter>,
    battery: Arc<StubBattery>,
    meter: Arc<StubMeter>,
    solar: Arc<StubSolarCharger>,
    grid_charger: Arc<StubGridCharger>,
    handle: Arc<SimulatedInverterHandle>,
    day: Arc<AtomicBool>,
    config: Arc<parking_lot::RwLock<Config>>,
}

fn battery_inverter_config() -> PowerLimiterInverterConfig {
    PowerLimiterInverterConfig {
        serial: SERIAL,
        is_governed: true,
        is_behind_power_meter: true,
        power_source: InverterPowerSource::Battery,
        lower_power_limit: 50,
        upper_power_limit: 800,
        use_overscaling: false,
        scaling_threshold: 98,
    }
}

async fn rig(meter_power: f32, inverter_output: f32) -> Rig {
    // make sure the uptime counter moved past zero, which doubles as the
    // "never updated" marker
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut config = Config::default();
    config.battery.enabled = true;
    config.power_limiter.enabled = true;
    config.power_limiter.inverters = vec![battery_inverter_config()];
    config.power_limiter.target_power_consumption = 0;
    config.power_limiter.target_power_consumption_hysteresis = 10;
    config.power_limiter.base_load_limit = 100;
    config.power_limiter.total_upper_power_limit = 800;
    config.power_limiter.battery_soc_start_threshold = 50.0;
    config.power_limiter.battery_soc_stop_threshold = 20.0;
    config.power_limiter.conduction_losses = 3;
    let config = Arc::new(parking_lot::RwLock::new(config));

    let battery = StubBattery::new();
    battery.set_soc(60.0);
    let meter = StubMeter::new(meter_power);
    let solar = StubSolarCharger::new();
    let grid_charger = StubGridCharger::new();

    let registry = SimulatedInverterRegistry::new();
    let handle = SimulatedInverterHandle::new(SERIAL);
    handle.modify_state(|state| {
        state.producing = inverter_output > 0.0;
        state.ac_output_watts = inverter_output;
        state.current_limit_watts = Some(inverter_output.max(50.0) as u16);
        state.max_power_watts = 1500;
    });
    handle.touch_stats();
    registry.add(Arc::clone(&handle));

    let day = Arc::new(AtomicBool::new(true));
    let (producing_tx, _producing_rx) = tokio::sync::watch::channel(false);

    let limiter = Arc::new(PowerLimiter::new(
        Arc::clone(&config),
        MqttService::disabled(),
        Arc::clone(&battery) as Arc<dyn Battery>,
        Arc::clone(&solar) as Arc<dyn SolarCharger>,
        Arc::clone(&meter) as Arc<dyn GridMeter>,
        Arc::clone(&grid_charger) as Arc<dyn GridCharger>,
        registry as Arc<dyn InverterRegistry>,
        SunPosition::shared(Arc::clone(&day)),
        producing_tx,
    ));

    // the first tick performs the initial configuration load
    limiter.tick().await;

    Rig { limiter, battery, meter, solar, grid_charger, handle, day, config }
}

/// Tick until the backoff window has certainly passed, refreshing inverter
/// stats in between like the radio stack would.
async fn settle(rig: &Rig) {
    for _ in 0..3 {
        rig.handle.touch_stats();
        rig.limiter.tick().await;
    }
}

/// The calculation backoff grows to 1024 ms while the system is stable;
/// wait it out so every phase is guaranteed a fresh calculation.
async fn tick_and_wait(rig: &Rig) {
    for _ in 0..2 {
        rig.handle.touch_stats();
        rig.limiter.tick().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }
}

#[tokio::test]
async fn single_battery_inverter_tracks_import() {
    let rig = rig(120.0, 300.0).await;

    settle(&rig).await;

    // target = 300 W output + 120 W import - 0 W target consumption
    assert_eq!(rig.handle.last_sent_limit(), Some(420));
    assert_eq!(rig.limiter.last_expected_output().await, 420);
}

#[tokio::test]
async fn differences_within_hysteresis_issue_no_commands() {
    // importing 5 W with a 10 W hysteresis: close enough, leave it alone
    let rig = rig(5.0, 300.0).await;

    settle(&rig).await;

    assert_eq!(rig.handle.last_sent_limit(), None);
    assert_eq!(rig.handle.sent_power_states(), Vec::<bool>::new());
}

#[tokio::test]
async fn export_pinning_with_negative_target() {
    let rig = rig(-500.0, 300.0).await;
    rig.config.write().power_limiter.target_power_consumption = -300;

    settle(&rig).await;

    // target = 300 + (-500) - (-300) = 100 W
    assert_eq!(rig.handle.last_sent_limit(), Some(100));
}

#[tokio::test]
async fn stop_threshold_drives_inverter_into_standby() {
    let rig = rig(120.0, 400.0).await;
    rig.battery.set_soc(19.0);

    settle(&rig).await;

    assert_eq!(rig.handle.sent_power_states().last(), Some(&false));
    assert!(!rig.handle.is_producing());
}

#[tokio::test]
async fn already_exporting_beyond_target_stops_production() {
    // exporting 900 W with everything the inverter produces deducted still
    // overshoots the target: no production wanted
    let rig = rig(-900.0, 300.0).await;

    settle(&rig).await;

    // requested 0 W, reduction beyond lower limit means standby
    assert_eq!(rig.handle.sent_power_states().last(), Some(&false));
}

#[tokio::test]
async fn grid_charger_auto_power_blocks_battery_draw() {
    let rig = rig(400.0, 0.0).await;
    rig.handle.modify_state(|state| {
        state.producing = false;
        state.ac_output_watts = 0.0;
    });
    rig.grid_charger.auto_power.store(true, Ordering::Relaxed);

    settle(&rig).await;

    // the charger owns the bus: the battery inverter must not be started
    assert_eq!(rig.handle.sent_power_states(), Vec::<bool>::new());
    assert_eq!(rig.handle.last_sent_limit(), None);
}

#[tokio::test]
async fn discharge_current_limit_caps_battery_allocation() {
    let rig = rig(600.0, 100.0).await;

    // 10 A at 48 V inverter DC voltage: 480 W DC, times 0.95 and 3 %
    // conduction losses: 442 W AC allowance
    *rig.battery.discharge_limit.lock() = 10.0;
    {
        let mut config = rig.config.write();
        config.power_limiter.inverter_serial_for_dc_voltage = SERIAL;
    }

    settle(&rig).await;

    let limit = rig.handle.last_sent_limit().expect("limit set");
    assert_eq!(limit, 442);
}

#[tokio::test]
async fn nighttime_discharge_latches_once_per_night() {
    let rig = rig(120.0, 100.0).await;
    {
        let mut config = rig.config.write();
        config.power_limiter.battery_always_use_at_night = true;
        config.power_limiter.battery_soc_start_threshold = 80.0;
    }
    rig.battery.set_soc(50.0);
    rig.day.store(false, Ordering::Relaxed);

    // night on a partially charged battery: discharge latches on
    tick_and_wait(&rig).await;
    assert_eq!(rig.limiter.ui_state().await, UiState::UseSolarAndBattery);

    // stop threshold ends the cycle; the inverter enters standby
    rig.battery.set_soc(19.0);
    tick_and_wait(&rig).await;
    assert_eq!(rig.limiter.ui_state().await, UiState::Charging);

    // recovering mid-range does not re-trigger in the same night
    rig.battery.set_soc(50.0);
    tick_and_wait(&rig).await;
    assert_eq!(rig.limiter.ui_state().await, UiState::Charging);

    // sunrise clears the latch; the start threshold is not reached
    rig.day.store(true, Ordering::Relaxed);
    tick_and_wait(&rig).await;
    assert_eq!(rig.limiter.ui_state().await, UiState::Charging);

    // the following night may latch again
    rig.day.store(false, Ordering::Relaxed);
    tick_and_wait(&rig).await;
    assert_eq!(rig.limiter.ui_state().await, UiState::UseSolarAndBattery);
}

#[tokio::test]
async fn full_solar_passthrough_converts_all_solar_power() {
    let rig = rig(120.0, 100.0).await;
    *rig.solar.stats.output_power.lock() = Some(400.0);

    rig.limiter
        .set_mode(open_microgrid_controller::powerlimiter::Mode::UnconditionalFullSolarPassthrough);

    settle(&rig).await;

    // 400 W DC times 0.95 efficiency and 3 % conduction losses = 368 W
    assert_eq!(rig.handle.last_sent_limit(), Some(368));
}
