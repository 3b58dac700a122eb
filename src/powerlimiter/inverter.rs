//! Per-inverter governance: target state, reduction/increase arithmetic and
//! overscaling.
//!
//! One type covers the three power-source classes; the few operations that
//! diverge dispatch on the class tag. Solar-powered inverters are never put
//! into standby by the limiter, they are clamped to their lower power limit
//! instead. Smart-buffer and battery-powered inverters may sleep.

use std::sync::Arc;
use tracing::{debug, warn};

use super::handle::{InverterHandle, InverterRegistry};
use crate::config::{InverterPowerSource, PowerLimiterInverterConfig};
use crate::uptime;

/// A command not acknowledged within this window counts as timed out.
const UPDATE_TIMEOUT_MILLIS: u32 = 30 * 1000;

/// Fallback conversion efficiency while the inverter reports none.
const FALLBACK_EFFICIENCY: f32 = 0.967;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Unreachable,
    SendingCommandsDisabled,
    MaxOutputUnknown,
    CurrentLimitUnknown,
    Eligible,
}

pub struct PowerLimiterInverter {
    config: PowerLimiterInverterConfig,
    handle: Arc<dyn InverterHandle>,

    retired: bool,

    update_timeouts: u8,
    update_start_millis: Option<u32>,
    target_limit_watts: Option<u16>,
    target_power_state: Option<bool>,
    limit_command_sent: bool,
    power_command_sent: bool,

    command_completed_at: Option<u32>,
    stats_snapshot: Option<u32>,

    /// Expected AC output; differs from the target limit when the limit is
    /// overscaled.
    expected_output_ac_watts: u16,
}

impl PowerLimiterInverter {
    pub fn create(
        config: PowerLimiterInverterConfig,
        registry: &dyn InverterRegistry,
    ) -> Option<Self> {
        let Some(handle) = registry.lookup(config.serial) else {
            warn!(serial = format_args!("{:016X}", config.serial), "unknown inverter serial");
            return None;
        };

        Some(Self {
            config,
            handle,
            retired: false,
            update_timeouts: 0,
            update_start_millis: None,
            target_limit_watts: None,
            target_power_state: None,
            limit_command_sent: false,
            power_command_sent: false,
            command_completed_at: None,
            stats_snapshot: None,
            expected_output_ac_watts: 0,
        })
    }

    pub fn serial(&self) -> u64 {
        self.config.serial
    }

    pub fn is_behind_power_meter(&self) -> bool {
        self.config.is_behind_power_meter
    }

    pub fn power_source(&self) -> InverterPowerSource {
        self.config.power_source
    }

    pub fn is_solar_powered(&self) -> bool {
        self.config.power_source == InverterPowerSource::Solar
    }

    pub fn is_battery_powered(&self) -> bool {
        self.config.power_source == InverterPowerSource::Battery
    }

    pub fn is_smart_buffer_powered(&self) -> bool {
        self.config.power_source == InverterPowerSource::SmartBuffer
    }

    pub fn is_reachable(&self) -> bool {
        self.handle.is_reachable()
    }

    pub fn is_producing(&self) -> bool {
        self.handle.is_producing()
    }

    pub fn update_timeouts(&self) -> u8 {
        self.update_timeouts
    }

    pub fn dc_voltage(&self, channel: u8) -> Option<f32> {
        self.handle.dc_voltage(channel)
    }

    /// Maximum AC power the device itself can produce.
    pub fn inverter_max_power_watts(&self) -> u16 {
        self.handle.max_power_watts()
    }

    /// Maximum AC power the inverter may produce per configuration,
    /// additionally restricted by the device's absolute maximum.
    pub fn configured_max_power_watts(&self) -> u16 {
        let device_max = self.handle.max_power_watts();
        if device_max == 0 {
            return self.config.upper_power_limit;
        }
        self.config.upper_power_limit.min(device_max)
    }

    pub fn current_output_ac_watts(&self) -> u16 {
        self.handle.ac_output_watts().round().max(0.0) as u16
    }

    /// Differs from the current output while a new limit is pending.
    pub fn expected_output_ac_watts(&self) -> u16 {
        self.expected_output_ac_watts
    }

    fn current_limit_watts(&self) -> u16 {
        self.handle.current_limit_watts().unwrap_or(0)
    }

    pub fn eligibility(&self) -> Eligibility {
        if !self.handle.is_reachable() {
            return Eligibility::Unreachable;
        }
        if !self.handle.commands_enabled() {
            return Eligibility::SendingCommandsDisabled;
        }
        if self.handle.max_power_watts() == 0 {
            return Eligibility::MaxOutputUnknown;
        }
        if self.handle.current_limit_watts().is_none() {
            return Eligibility::CurrentLimitUnknown;
        }
        Eligibility::Eligible
    }

    pub fn is_eligible(&self) -> bool {
        self.eligibility() == Eligibility::Eligible
    }

    /// Timestamp of the oldest stats received *after* the last command
    /// completed; `None` while such stats are still pending.
    pub fn latest_stats_millis(&mut self) -> Option<u32> {
        if self.stats_snapshot.is_none() {
            let stats = self.handle.stats_millis();
            let fresh = match self.command_completed_at {
                Some(completed) => uptime::at_or_after(stats, completed),
                None => stats > 0,
            };
            if fresh {
                self.stats_snapshot = Some(stats);
            }
        }
        self.stats_snapshot
    }

    /// Drive the pending target state. Returns `true` while a command is in
    /// flight, i.e. while the target state is not yet reflected by the
    /// inverter's statistics.
    pub fn update(&mut self) -> bool {
        if self.target_limit_watts.is_none() && self.target_power_state.is_none() {
            return false;
        }

        let now = uptime::millis();
        let started = *self.update_start_millis.get_or_insert(now);

        if uptime::elapsed(now, started) > UPDATE_TIMEOUT_MILLIS {
            self.update_timeouts = self.update_timeouts.saturating_add(1);
            warn!(
                serial = format_args!("{:016X}", self.config.serial),
                timeouts = self.update_timeouts,
                "command was not reflected in time, giving up"
            );
            self.finish_update(now);
            return false;
        }

        // apply the limit first so a waking inverter does not briefly
        // produce at its previous limit
        if let Some(target) = self.target_limit_watts {
            let acknowledged = self.handle.current_limit_watts() == Some(target)
                && uptime::at_or_after(self.handle.stats_millis(), started);

            if acknowledged {
                self.target_limit_watts = None;
                self.limit_command_sent = false;
            } else {
                if !self.limit_command_sent {
                    debug!(
                        serial = format_args!("{:016X}", self.config.serial),
                        target, "sending power limit"
                    );
                    if self.handle.send_active_power_limit(target) {
                        self.limit_command_sent = true;
                    }
                }
                return true;
            }
        }

        if let Some(target) = self.target_power_state {
            let acknowledged = self.handle.is_producing() == target
                && uptime::at_or_after(self.handle.stats_millis(), started);

            if acknowledged {
                self.target_power_state = None;
                self.power_command_sent = false;
            } else {
                if !self.power_command_sent {
                    debug!(
                        serial = format_args!("{:016X}", self.config.serial),
                        target, "sending power state"
                    );
                    if self.handle.send_power_state(target) {
                        self.power_command_sent = true;
                    }
                }
                return true;
            }
        }

        self.finish_update(now);
        false
    }

    fn finish_update(&mut self, now: u32) {
        self.target_limit_watts = None;
        self.target_power_state = None;
        self.limit_command_sent = false;
        self.power_command_sent = false;
        self.update_start_millis = None;

        // only stats received from here on count as current
        self.command_completed_at = Some(now);
        self.stats_snapshot = None;
    }

    /// Take the inverter out of governance. Issues one standby transition,
    /// then reports `true` while that command is pending.
    pub fn retire(&mut self) -> bool {
        if !self.retired {
            self.retired = true;
            self.standby();
        }
        self.update()
    }

    pub fn restart(&mut self) {
        self.handle.send_restart();
    }

    /// Wake the inverter and let it produce as much as its upper power
    /// limit permits.
    pub fn set_max_output(&mut self) {
        self.set_ac_output(self.configured_max_power_watts());
    }

    // -----------------------------------------------------------------
    // class-dependent operations

    /// Maximum power reduction achievable, optionally by entering standby.
    pub fn max_reduction_watts(&self, allow_standby: bool) -> u16 {
        if !self.is_eligible() {
            return 0;
        }

        let output = self.current_output_ac_watts();
        let lower = self.config.lower_power_limit;

        match self.config.power_source {
            InverterPowerSource::Solar => {
                let low = self.current_limit_watts().min(output);
                if low <= lower {
                    return 0;
                }
                output.saturating_sub(lower)
            }
            InverterPowerSource::SmartBuffer | InverterPowerSource::Battery => {
                if !self.is_producing() {
                    return 0;
                }
                if allow_standby {
                    return output;
                }
                output.saturating_sub(lower)
            }
        }
    }

    /// Maximum power increase this inverter is expected to achieve,
    /// possibly coming out of standby.
    pub fn max_increase_watts(&self) -> u16 {
        if !self.is_eligible() {
            return 0;
        }

        match self.config.power_source {
            InverterPowerSource::Solar => self.solar_max_increase_watts(),
            InverterPowerSource::SmartBuffer | InverterPowerSource::Battery => {
                if !self.is_producing() {
                    return self.configured_max_power_watts();
                }

                // an overscaled limit can exceed the configured maximum, so
                // the current output is the baseline in that case
                if self.overscaling_applies() {
                    return self
                        .configured_max_power_watts()
                        .saturating_sub(self.current_output_ac_watts());
                }

                // use the limit, not the output: the actual output may sit
                // below the limit and must not tempt us into raising further
                self.configured_max_power_watts()
                    .saturating_sub(self.current_limit_watts())
            }
        }
    }

    /// Per-MPPT shading analysis: an inverter with shaded inputs can only
    /// raise output on the non-shaded ones.
    fn solar_max_increase_watts(&self) -> u16 {
        if !self.is_producing() {
            // not producing: we cannot tell how much headroom there is, so
            // assume the maximum
            return self.configured_max_power_watts();
        }

        let max_total_increase = self
            .configured_max_power_watts()
            .saturating_sub(self.current_output_ac_watts());

        let mppts = self.handle.mppts();
        let total_mppts = mppts.len();
        if total_mppts == 0 {
            return max_total_increase;
        }

        let efficiency = self.handle.efficiency_percent() / 100.0;

        // 97 % of the expected power is good enough; a configured scaling
        // threshold below that tightens the bound when overscaling applies
        let mut expected_power_percentage: f32 = 0.97;
        if self.overscaling_applies() {
            expected_power_percentage =
                expected_power_percentage.min(self.config.scaling_threshold as f32 / 100.0);
        }

        let expected_ac_per_mppt =
            self.current_limit_watts() as f32 / total_mppts as f32 * expected_power_percentage;

        let mut non_shaded_mppts = 0usize;
        let mut non_shaded_ac_sum = 0.0f32;

        for mppt in &mppts {
            let mppt_ac: f32 = self
                .handle
                .dc_channels_by_mppt(*mppt)
                .iter()
                .map(|channel| self.handle.dc_power_watts(*channel) * efficiency)
                .sum();

            if mppt_ac >= expected_ac_per_mppt {
                non_shaded_ac_sum += mppt_ac;
                non_shaded_mppts += 1;
            }
        }

        if non_shaded_mppts == 0 {
            // all inputs shaded, no room to grow
            return 0;
        }

        if non_shaded_mppts == total_mppts {
            return max_total_increase;
        }

        // without PDL the inverter divides its limit equally across the
        // MPPTs, so each can only use its equal share of the configured
        // maximum; with PDL or overscaling each input can run up to its
        // share of the device maximum
        let mut inverter_max = self.configured_max_power_watts();
        if self.handle.supports_power_distribution_logic() || self.config.use_overscaling {
            inverter_max = self.inverter_max_power_watts();
        }

        let max_per_mppt = inverter_max as f32 / total_mppts as f32;
        let current_per_non_shaded = non_shaded_ac_sum / non_shaded_mppts as f32;
        let increase_per_non_shaded = (max_per_mppt - current_per_non_shaded).max(0.0);
        let increase_non_shaded = (increase_per_non_shaded * non_shaded_mppts as f32) as u16;

        max_total_increase.min(increase_non_shaded)
    }

    /// Change the target such that the requested reduction becomes
    /// effective. Returns the reduction that will be achieved.
    pub fn apply_reduction(&mut self, reduction: u16, allow_standby: bool) -> u16 {
        if !self.is_eligible() || reduction == 0 {
            return 0;
        }

        let output = self.current_output_ac_watts();
        let lower = self.config.lower_power_limit;

        match self.config.power_source {
            InverterPowerSource::Solar => {
                if output.saturating_sub(lower) >= reduction {
                    self.set_ac_output(output - reduction);
                    return reduction;
                }
                self.set_ac_output(lower);
                output.saturating_sub(lower)
            }
            InverterPowerSource::SmartBuffer | InverterPowerSource::Battery => {
                let low = self.current_limit_watts().min(output);
                if low <= lower {
                    if allow_standby {
                        self.standby();
                        return reduction.min(output);
                    }
                    return 0;
                }

                if output.saturating_sub(lower) >= reduction {
                    self.set_ac_output(output - reduction);
                    return reduction;
                }

                if allow_standby {
                    self.standby();
                    return reduction.min(output);
                }

                self.set_ac_output(lower);
                output.saturating_sub(lower)
            }
        }
    }

    /// Raise the expected output by up to `increase`. A sleeping inverter
    /// is only woken if the increase covers its lower power limit.
    pub fn apply_increase(&mut self, increase: u16) -> u16 {
        if !self.is_eligible() || increase == 0 {
            return 0;
        }

        if !self.is_producing() && self.config.lower_power_limit > increase {
            return 0;
        }

        // the current limit might be overscaled, so the current output is
        // the baseline, not the limit; inverters in standby have none
        let baseline = self.current_output_ac_watts();

        let actual_increase = increase.min(self.max_increase_watts());
        self.set_ac_output(baseline + actual_increase);
        actual_increase
    }

    /// Stop producing. Solar-powered inverters are clamped to their lower
    /// power limit instead of sleeping. Returns the change in output that
    /// will become effective.
    pub fn standby(&mut self) -> u16 {
        match self.config.power_source {
            InverterPowerSource::Solar => {
                let output = self.current_output_ac_watts();
                self.set_ac_output(self.config.lower_power_limit);
                output.saturating_sub(self.config.lower_power_limit)
            }
            InverterPowerSource::SmartBuffer | InverterPowerSource::Battery => {
                self.target_power_state = Some(false);
                self.expected_output_ac_watts = 0;
                self.current_output_ac_watts()
            }
        }
    }

    fn set_ac_output(&mut self, watts: u16) {
        let expected = watts
            .min(self.configured_max_power_watts())
            .max(self.config.lower_power_limit);

        self.expected_output_ac_watts = expected;
        self.target_limit_watts = Some(self.scale_limit(expected));
        self.target_power_state = Some(true);
    }

    fn overscaling_applies(&self) -> bool {
        self.config.use_overscaling && !self.handle.supports_power_distribution_logic()
    }

    /// Compensate for shaded inputs by raising the total limit, so the
    /// non-shaded inputs can cover the expected output. Inverters with
    /// power distribution logic redistribute on their own.
    fn scale_limit(&self, expected_output_watts: u16) -> u16 {
        let configured_max = self.configured_max_power_watts();

        if !self.overscaling_applies() {
            return expected_output_watts;
        }

        // input channels of a sleeping inverter all read as non-producing,
        // which would cause absurd scaling
        if !self.is_producing() {
            return expected_output_watts;
        }

        let mppts = self.handle.mppts();
        let total_mppts = mppts.len();

        // a single input leaves nothing to redistribute
        if total_mppts <= 1 {
            return expected_output_watts;
        }

        // below this limit the channel readings are too small to tell a
        // shaded input from one throttled by the limit
        let channel_count = self.handle.dc_channel_count();
        if (self.current_limit_watts() as usize) < channel_count * 10 {
            return expected_output_watts;
        }

        let reported_efficiency = self.handle.efficiency_percent();
        let efficiency = if reported_efficiency > 0.0 {
            reported_efficiency / 100.0
        } else {
            FALLBACK_EFFICIENCY
        };

        let scaling_threshold = self.config.scaling_threshold as f32 / 100.0;
        let expected_ac_per_mppt =
            self.current_limit_watts() as f32 / total_mppts as f32 * scaling_threshold;

        let mut shaded_mppts = 0usize;
        let mut shaded_ac_sum = 0.0f32;

        for mppt in &mppts {
            let mppt_ac: f32 = self
                .handle
                .dc_channels_by_mppt(*mppt)
                .iter()
                .map(|channel| self.handle.dc_power_watts(*channel) * efficiency)
                .sum();

            if mppt_ac < expected_ac_per_mppt {
                shaded_mppts += 1;
                shaded_ac_sum += mppt_ac;
            }
        }

        // no shading, or the shaded inputs alone cover the request
        if shaded_mppts == 0 || shaded_ac_sum >= expected_output_watts as f32 {
            return expected_output_watts;
        }

        if shaded_mppts == total_mppts {
            // uniformly dim conditions: hold the current limit while it is
            // high enough and the output does not overshoot
            if self.current_limit_watts() >= expected_output_watts
                && self.current_output_ac_watts() <= expected_output_watts
            {
                return self.current_limit_watts().min(configured_max);
            }
            return expected_output_watts;
        }

        let non_shaded_mppts = total_mppts - shaded_mppts;
        let over_scaled = ((expected_output_watts as f32 - shaded_ac_sum)
            / non_shaded_mppts as f32
            * total_mppts as f32) as u16;

        if over_scaled <= expected_output_watts {
            return expected_output_watts;
        }

        debug!(
            serial = format_args!("{:016X}", self.config.serial),
            shaded_mppts, total_mppts, over_scaled, "scaling limit for shaded inputs"
        );

        over_scaled.min(configured_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powerlimiter::handle::{
        SimulatedInverterHandle, SimulatedInverterRegistry, SimulatedInverterState,
    };
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn inverter_with(
        config: PowerLimiterInverterConfig,
        state: SimulatedInverterState,
    ) -> (PowerLimiterInverter, Arc<SimulatedInverterHandle>) {
        let registry = SimulatedInverterRegistry::new();
        let handle = SimulatedInverterHandle::with_state(config.serial, state);
        registry.add(Arc::clone(&handle));
        let inverter = PowerLimiterInverter::create(config, registry.as_ref()).unwrap();
        (inverter, handle)
    }

    fn solar_config() -> PowerLimiterInverterConfig {
        PowerLimiterInverterConfig {
            serial: 0x1161_0001,
            is_governed: true,
            power_source: InverterPowerSource::Solar,
            lower_power_limit: 50,
            upper_power_limit: 800,
            use_overscaling: true,
            scaling_threshold: 97,
            ..Default::default()
        }
    }

    fn producing_state(output: f32, limit: u16) -> SimulatedInverterState {
        SimulatedInverterState {
            producing: true,
            current_limit_watts: Some(limit),
            ac_output_watts: output,
            stats_millis: crate::uptime::millis().max(1),
            ..Default::default()
        }
    }

    #[test]
    fn eligibility_reports_first_failing_requirement() {
        let (inverter, handle) = inverter_with(solar_config(), producing_state(300.0, 600));
        assert_eq!(inverter.eligibility(), Eligibility::Eligible);

        handle.modify_state(|s| s.current_limit_watts = None);
        assert_eq!(inverter.eligibility(), Eligibility::CurrentLimitUnknown);

        handle.modify_state(|s| s.max_power_watts = 0);
        assert_eq!(inverter.eligibility(), Eligibility::MaxOutputUnknown);

        handle.modify_state(|s| s.commands_enabled = false);
        assert_eq!(inverter.eligibility(), Eligibility::SendingCommandsDisabled);

        handle.modify_state(|s| s.reachable = false);
        assert_eq!(inverter.eligibility(), Eligibility::Unreachable);
    }

    #[test]
    fn update_is_idle_without_target() {
        let (mut inverter, handle) = inverter_with(solar_config(), producing_state(300.0, 600));
        assert!(!inverter.update());
        assert!(handle.sent_limits().is_empty());
    }

    #[test]
    fn update_completes_when_stats_reflect_the_command() {
        let (mut inverter, handle) = inverter_with(solar_config(), producing_state(300.0, 600));

        inverter.apply_reduction(100, false);
        assert!(inverter.update()); // command sent, waiting for fresh stats
        assert_eq!(handle.last_sent_limit(), Some(200));

        // the simulated handle acknowledged instantly, so the next update
        // pass observes the new limit and finishes
        assert!(!inverter.update());
        assert!(inverter.latest_stats_millis().is_some());
    }

    #[test]
    fn update_stays_pending_until_the_inverter_acknowledges() {
        let mut state = producing_state(300.0, 600);
        state.auto_ack = false;
        let (mut inverter, handle) = inverter_with(solar_config(), state);

        inverter.apply_reduction(100, false);
        assert!(inverter.update());
        assert!(inverter.update()); // still pending; the command is not re-sent
        assert_eq!(handle.sent_limits().len(), 1);

        // the inverter reports the new limit with fresh statistics
        handle.modify_state(|s| s.current_limit_watts = Some(200));
        handle.touch_stats();
        assert!(!inverter.update());
        assert!(inverter.latest_stats_millis().is_some());
    }

    #[test]
    fn solar_inverter_is_clamped_not_stopped() {
        let (mut inverter, handle) = inverter_with(solar_config(), producing_state(400.0, 600));

        let reduced = inverter.apply_reduction(500, true);
        assert_eq!(reduced, 350); // down to the 50 W lower limit
        assert_eq!(inverter.expected_output_ac_watts(), 50);

        while inverter.update() {}
        // never a power-off command for solar
        assert!(handle.sent_power_states().iter().all(|on| *on));
    }

    #[test]
    fn smart_buffer_enters_standby_when_allowed() {
        let mut config = solar_config();
        config.power_source = InverterPowerSource::SmartBuffer;
        let (mut inverter, handle) = inverter_with(config, producing_state(60.0, 60));

        // at the lower limit already; reduction requires standby
        let reduced = inverter.apply_reduction(40, true);
        assert_eq!(reduced, 40);
        assert_eq!(inverter.expected_output_ac_watts(), 0);

        while inverter.update() {}
        assert_eq!(handle.sent_power_states(), vec![false]);
    }

    #[test]
    fn smart_buffer_without_standby_clamps_to_lower_limit() {
        let mut config = solar_config();
        config.power_source = InverterPowerSource::SmartBuffer;
        let (mut inverter, _handle) = inverter_with(config, producing_state(200.0, 200));

        let reduced = inverter.apply_reduction(180, false);
        assert_eq!(reduced, 150);
        assert_eq!(inverter.expected_output_ac_watts(), 50);
    }

    #[test]
    fn sleeping_battery_inverter_wakes_only_for_sufficient_increase() {
        let mut config = solar_config();
        config.power_source = InverterPowerSource::Battery;
        config.use_overscaling = false;
        let mut state = producing_state(0.0, 100);
        state.producing = false;
        let (mut inverter, _handle) = inverter_with(config, state);

        assert_eq!(inverter.apply_increase(40), 0); // below the 50 W lower limit
        let granted = inverter.apply_increase(300);
        assert_eq!(granted, 300);
        assert_eq!(inverter.expected_output_ac_watts(), 300);
    }

    #[test]
    fn scale_limit_redistributes_shaded_input() {
        // two MPPTs, one shaded: panel A 350 W DC, panel B 40 W DC at 96 %
        let mut state = producing_state(330.0, 600);
        state.efficiency_percent = 96.0;
        state.channels_per_mppt = vec![vec![0], vec![1]];
        state.dc_power_per_channel = HashMap::from([(0, 350.0), (1, 40.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        // expected per MPPT: 600 / 2 * 0.97 = 291 W; B yields 38.4 W
        // over-scaled: (600 - 38.4) * 2 / 1 = 1123 W, capped at 800 W
        assert_eq!(inverter.scale_limit(600), 800);
    }

    #[test]
    fn scale_limit_passes_through_without_shading() {
        let mut state = producing_state(330.0, 600);
        state.channels_per_mppt = vec![vec![0], vec![1]];
        state.dc_power_per_channel = HashMap::from([(0, 300.0), (1, 310.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        assert_eq!(inverter.scale_limit(500), 500);
    }

    #[test]
    fn scale_limit_with_single_mppt_is_identity() {
        let mut state = producing_state(330.0, 600);
        state.channels_per_mppt = vec![vec![0]];
        state.dc_power_per_channel = HashMap::from([(0, 10.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        assert_eq!(inverter.scale_limit(400), 400);
    }

    #[test]
    fn scale_limit_distrusts_tiny_limits() {
        let mut state = producing_state(15.0, 15);
        state.channels_per_mppt = vec![vec![0], vec![1]];
        state.dc_power_per_channel = HashMap::from([(0, 10.0), (1, 0.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        // limit below 10 W per channel: readings are not trustworthy
        assert_eq!(inverter.scale_limit(15), 15);
    }

    #[test]
    fn scale_limit_holds_limit_when_everything_is_shaded() {
        let mut state = producing_state(80.0, 400);
        state.channels_per_mppt = vec![vec![0], vec![1]];
        state.dc_power_per_channel = HashMap::from([(0, 45.0), (1, 40.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        // all inputs below 400 / 2 * 0.97 = 194 W, current limit covers the
        // request and the output does not overshoot
        assert_eq!(inverter.scale_limit(100), 400);
    }

    #[test]
    fn pdl_inverters_are_never_overscaled() {
        let mut state = producing_state(330.0, 600);
        state.supports_pdl = true;
        state.channels_per_mppt = vec![vec![0], vec![1]];
        state.dc_power_per_channel = HashMap::from([(0, 350.0), (1, 40.0)]);
        let (inverter, _handle) = inverter_with(solar_config(), state);

        assert_eq!(inverter.scale_limit(600), 600);
    }

    proptest! {
        #[test]
        fn overscaling_never_exceeds_configured_max(
            expected in 0u16..2000,
            limit in 0u16..2000,
            output in 0.0f32..2000.0,
            dc_a in 0.0f32..1000.0,
            dc_b in 0.0f32..1000.0,
            threshold in 1u8..=100,
        ) {
            let mut config = solar_config();
            config.scaling_threshold = threshold;

            let mut state = producing_state(output, limit);
            state.channels_per_mppt = vec![vec![0], vec![1]];
            state.dc_power_per_channel = HashMap::from([(0, dc_a), (1, dc_b)]);
            let (inverter, _handle) = inverter_with(config, state);

            let expected_capped = expected.min(inverter.configured_max_power_watts());
            prop_assert!(
                inverter.scale_limit(expected_capped) <= inverter.configured_max_power_watts()
            );
        }
    }
}
