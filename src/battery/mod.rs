//! Battery subsystem: provider lifecycle, discharge-limit arbitration and
//! the persistent charge history.

pub mod mqtt;
pub mod pylontech;
pub mod stats;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BatteryConfig, BatteryProvider, Config};
use crate::hardware::factory::TransportFactory;
use crate::mqtt::MqttService;
use crate::uptime;

pub use stats::{BatteryStats, SharedStats};

/// Stats older than this are not acted upon by any control decision.
const STATS_FRESHNESS_SECONDS: u32 = 60;

#[async_trait]
pub trait Provider: Send + Sync {
    async fn init(&mut self) -> anyhow::Result<()>;
    async fn deinit(&mut self);
    async fn tick(&mut self) {}
    fn stats(&self) -> &SharedStats;
}

/// Battery interface as seen by its consumers (power limiter, grid
/// charger).
#[async_trait]
pub trait Battery: Send + Sync {
    async fn stats(&self) -> SharedStats;
    async fn discharge_current_limit(&self) -> f32;
}

/// Wall-clock keyed battery milestones, persisted as MQTT-retained values
/// and re-established at boot.
#[derive(Debug, Default, Clone, Copy)]
struct ChargeHistory {
    last_full_charge_epoch: Option<i64>,
    last_empty_epoch: Option<i64>,
}

pub struct Controller {
    config: Arc<parking_lot::RwLock<Config>>,
    mqtt: Arc<MqttService>,
    factory: Arc<TransportFactory>,
    provider: tokio::sync::Mutex<Option<Box<dyn Provider>>>,
    dummy_stats: SharedStats,
    history: Arc<Mutex<ChargeHistory>>,
    last_publish: AtomicU32,
}

impl Controller {
    pub fn new(
        config: Arc<parking_lot::RwLock<Config>>,
        mqtt: Arc<MqttService>,
        factory: Arc<TransportFactory>,
    ) -> Self {
        Self {
            config,
            mqtt,
            factory,
            provider: tokio::sync::Mutex::new(None),
            dummy_stats: BatteryStats::new_shared(),
            history: Arc::new(Mutex::new(ChargeHistory::default())),
            last_publish: AtomicU32::new(0),
        }
    }

    /// Subscribe the retained charge-history topics so the counters survive
    /// reboots. Called once at boot.
    pub async fn restore_history(&self) {
        let prefix = self.mqtt.prefix().to_string();

        type Select = fn(&mut ChargeHistory) -> &mut Option<i64>;
        let entries: [(&str, Select); 2] = [
            ("battery/history/lastFullCharge", |h| &mut h.last_full_charge_epoch),
            ("battery/history/lastEmpty", |h| &mut h.last_empty_epoch),
        ];

        for (topic, select) in entries {
            let history = Arc::clone(&self.history);
            self.mqtt
                .subscribe(
                    &format!("{prefix}{topic}"),
                    Arc::new(move |_topic, payload| {
                        let Ok(text) = std::str::from_utf8(payload) else { return };
                        let Ok(epoch) = text.trim().parse::<i64>() else { return };

                        let mut history = history.lock();
                        let slot = select(&mut history);
                        // retained seed only; never overwrite a live value
                        if slot.is_none() {
                            *slot = Some(epoch);
                        }
                    }),
                )
                .await;
        }
    }

    pub async fn update_settings(&self) {
        let mut slot = self.provider.lock().await;

        if let Some(mut old) = slot.take() {
            old.deinit().await;
        }

        let battery_config = {
            let config = self.config.read();
            if !config.battery.enabled {
                return;
            }
            config.battery.clone()
        };

        let mut provider: Box<dyn Provider> = match battery_config.provider {
            BatteryProvider::Mqtt => Box::new(mqtt::MqttProvider::new(
                battery_config.clone(),
                Arc::clone(&self.mqtt),
            )),
            BatteryProvider::PylontechCan => Box::new(pylontech::PylontechCanProvider::new(
                self.factory.create_battery_can_bus(),
            )),
        };

        match provider.init().await {
            Ok(()) => {
                info!(provider = ?battery_config.provider, "battery provider ready");
                *slot = Some(provider);
            }
            Err(e) => warn!(error = %e, "battery provider init failed"),
        }
    }

    /// Latest battery stats, or an all-invalid dummy while no provider runs.
    pub async fn stats(&self) -> SharedStats {
        let slot = self.provider.lock().await;
        match slot.as_ref() {
            Some(provider) => Arc::clone(provider.stats()),
            None => Arc::clone(&self.dummy_stats),
        }
    }

    /// Effective cap on battery discharge current in amperes;
    /// `f32::MAX` if uncapped.
    pub async fn discharge_current_limit(&self) -> f32 {
        let stats = self.stats().await;
        let (battery_config, ignore_soc) = {
            let config = self.config.read();
            (config.battery.clone(), config.power_limiter.ignore_soc)
        };
        let snapshot = stats.read();
        effective_discharge_current_limit(&battery_config, ignore_soc, &snapshot)
    }

    pub async fn tick(&self) {
        let mut slot = self.provider.lock().await;
        let Some(provider) = slot.as_mut() else { return };

        provider.tick().await;

        let stats = Arc::clone(provider.stats());
        drop(slot);

        self.update_history(&stats).await;
        self.publish_stats(&stats).await;
    }

    async fn update_history(&self, stats: &SharedStats) {
        let (soc, soc_valid) = {
            let stats = stats.read();
            (stats.soc(), stats.is_soc_valid() && stats.soc_age_seconds() <= STATS_FRESHNESS_SECONDS)
        };
        if !soc_valid || !uptime::wall_clock_valid() {
            return;
        }

        let now_epoch = Utc::now().timestamp();
        let mut full_changed = false;
        let mut empty_changed = false;

        {
            let mut history = self.history.lock();
            if soc >= 99.9 {
                // refresh at most once a minute while the battery sits full
                let stale = history
                    .last_full_charge_epoch
                    .map_or(true, |epoch| now_epoch - epoch >= 60);
                if stale {
                    history.last_full_charge_epoch = Some(now_epoch);
                    full_changed = true;
                }
            }
            if soc <= 0.1 {
                let stale = history
                    .last_empty_epoch
                    .map_or(true, |epoch| now_epoch - epoch >= 60);
                if stale {
                    history.last_empty_epoch = Some(now_epoch);
                    empty_changed = true;
                }
            }
        }

        if full_changed {
            self.mqtt
                .publish_retained("battery/history/lastFullCharge", now_epoch.to_string())
                .await;
        }
        if empty_changed {
            self.mqtt
                .publish_retained("battery/history/lastEmpty", now_epoch.to_string())
                .await;
        }
    }

    /// Hours since the battery last reached full charge, if ever observed.
    pub fn last_full_charge_hours(&self) -> Option<u32> {
        let last_full = self.history.lock().last_full_charge_epoch?;
        let elapsed = Utc::now().timestamp().saturating_sub(last_full);
        Some((elapsed.max(0) / 3600) as u32)
    }

    async fn publish_stats(&self, stats: &SharedStats) {
        let publish_interval = {
            let config = self.config.read();
            config.mqtt.publish_interval_secs as u32 * 1000
        };

        if !self.mqtt.is_connected() {
            return;
        }

        let now = uptime::millis();
        if uptime::elapsed(now, self.last_publish.load(Ordering::Relaxed)) < publish_interval {
            return;
        }
        self.last_publish.store(now, Ordering::Relaxed);

        let (
            manufacturer,
            age_seconds,
            soc_valid,
            soc,
            voltage_valid,
            voltage,
            current_valid,
            charge_current,
            discharge_current_limit_valid,
            discharge_current_limit,
            immediate_charging_request,
        ) = {
            let snapshot = stats.read();
            (
                snapshot.manufacturer().map(|m| m.to_string()),
                snapshot.age_seconds(),
                snapshot.is_soc_valid(),
                snapshot.soc(),
                snapshot.is_voltage_valid(),
                snapshot.voltage(),
                snapshot.is_current_valid(),
                snapshot.charge_current(),
                snapshot.is_discharge_current_limit_valid(),
                snapshot.discharge_current_limit(),
                snapshot.immediate_charging_request(),
            )
        };

        if let Some(manufacturer) = manufacturer {
            self.mqtt
                .publish("battery/manufacturer", manufacturer.to_string())
                .await;
        }
        self.mqtt
            .publish("battery/dataAge", age_seconds.to_string())
            .await;

        if soc_valid {
            self.mqtt
                .publish("battery/stateOfCharge", soc.to_string())
                .await;
        }
        if voltage_valid {
            self.mqtt
                .publish("battery/voltage", voltage.to_string())
                .await;
        }
        if current_valid {
            self.mqtt
                .publish("battery/current", charge_current.to_string())
                .await;
        }
        if discharge_current_limit_valid {
            self.mqtt
                .publish(
                    "battery/settings/dischargeCurrentLimitation",
                    discharge_current_limit.to_string(),
                )
                .await;
        }
        self.mqtt
            .publish(
                "battery/charging/chargeImmediately",
                (immediate_charging_request as u8).to_string(),
            )
            .await;

        if let Some(hours) = self.last_full_charge_hours() {
            self.mqtt
                .publish("battery/lastFullChargeHours", hours.to_string())
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
impl Battery for Controller {
    async fn stats(&self) -> SharedStats {
        Controller::stats(self).await
    }

    async fn discharge_current_limit(&self) -> f32 {
        Controller::discharge_current_limit(self).await
    }
}

/// Arbitration of the user-configured discharge current cap against the
/// BMS-reported limit.
///
/// The SoC fails open (100 %) and the voltage fails closed (0 V) when stale,
/// which errs toward applying the user-configured cap.
fn effective_discharge_current_limit(
    config: &BatteryConfig,
    ignore_soc: bool,
    stats: &BatteryStats,
) -> f32 {
    if !config.enable_discharge_current_limit {
        return f32::MAX;
    }

    let user_limit = config.discharge_current_limit;
    let mut user_limit_valid = user_limit > 0.0;

    let soc_valid = stats.is_soc_valid()
        && stats.soc_age_seconds() <= STATS_FRESHNESS_SECONDS
        && !ignore_soc;
    let soc = if soc_valid { stats.soc() } else { 100.0 };

    let voltage_valid =
        stats.is_voltage_valid() && stats.voltage_age_seconds() <= STATS_FRESHNESS_SECONDS;
    let voltage = if voltage_valid { stats.voltage() } else { 0.0 };

    let stats_limit = stats.discharge_current_limit().abs();
    let stats_limit_valid = config.use_battery_reported_discharge_current_limit
        && stats.discharge_current_limit() >= 0.0
        && stats.is_discharge_current_limit_valid()
        && stats.discharge_current_limit_age_seconds() <= STATS_FRESHNESS_SECONDS;

    if soc > config.discharge_current_limit_below_soc
        && voltage > config.discharge_current_limit_below_voltage
    {
        // above both thresholds only the BMS-provided limit applies
        user_limit_valid = false;
    }

    match (stats_limit_valid, user_limit_valid) {
        (true, true) => stats_limit.min(user_limit),
        (true, false) => stats_limit,
        (false, true) => user_limit,
        (false, false) => f32::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config_with_limit(limit: f32, below_soc: f32, below_voltage: f32) -> BatteryConfig {
        BatteryConfig {
            enabled: true,
            enable_discharge_current_limit: true,
            discharge_current_limit: limit,
            discharge_current_limit_below_soc: below_soc,
            discharge_current_limit_below_voltage: below_voltage,
            use_battery_reported_discharge_current_limit: true,
            ..Default::default()
        }
    }

    fn fresh_stats(soc: f32, voltage: f32, bms_limit: Option<f32>) -> BatteryStats {
        let now = uptime::millis().max(1);
        let mut stats = BatteryStats::default();
        stats.set_soc(soc, 0, now);
        stats.set_voltage(voltage, now);
        if let Some(limit) = bms_limit {
            stats.set_discharge_current_limit(limit, now);
        }
        stats
    }

    #[test]
    fn disabled_cap_is_unbounded() {
        let mut config = config_with_limit(30.0, 50.0, 48.0);
        config.enable_discharge_current_limit = false;
        let stats = fresh_stats(20.0, 47.0, Some(40.0));

        assert_eq!(
            effective_discharge_current_limit(&config, false, &stats),
            f32::MAX
        );
    }

    #[test]
    fn above_both_thresholds_only_bms_limit_applies() {
        let config = config_with_limit(30.0, 50.0, 48.0);
        let stats = fresh_stats(80.0, 52.0, Some(40.0));

        assert_eq!(effective_discharge_current_limit(&config, false, &stats), 40.0);
    }

    #[test]
    fn above_thresholds_without_bms_limit_is_unbounded() {
        let config = config_with_limit(30.0, 50.0, 48.0);
        let stats = fresh_stats(80.0, 52.0, None);

        assert_eq!(
            effective_discharge_current_limit(&config, false, &stats),
            f32::MAX
        );
    }

    #[rstest]
    #[case(20.0, 52.0)] // below SoC threshold
    #[case(80.0, 47.0)] // below voltage threshold
    fn below_either_threshold_takes_minimum(#[case] soc: f32, #[case] voltage: f32) {
        let config = config_with_limit(30.0, 50.0, 48.0);
        let stats = fresh_stats(soc, voltage, Some(40.0));

        assert_eq!(effective_discharge_current_limit(&config, false, &stats), 30.0);
    }

    #[test]
    fn stale_soc_fails_open() {
        // no SoC at all: treated as 100 %, so the SoC threshold is not
        // crossed, but the voltage threshold still is
        let config = config_with_limit(30.0, 50.0, 48.0);
        let mut stats = BatteryStats::default();
        stats.set_voltage(47.0, uptime::millis().max(1));

        assert_eq!(effective_discharge_current_limit(&config, false, &stats), 30.0);
    }

    #[test]
    fn missing_voltage_fails_closed() {
        // no voltage: treated as 0 V, which is below the threshold, so the
        // user cap stays armed
        let config = config_with_limit(30.0, 50.0, 48.0);
        let mut stats = BatteryStats::default();
        stats.set_soc(90.0, 0, uptime::millis().max(1));

        assert_eq!(effective_discharge_current_limit(&config, false, &stats), 30.0);
    }

    #[test]
    fn negative_bms_limit_is_ignored() {
        let config = config_with_limit(30.0, 50.0, 48.0);
        let stats = fresh_stats(20.0, 47.0, Some(-5.0));

        assert_eq!(effective_discharge_current_limit(&config, false, &stats), 30.0);
    }
}
