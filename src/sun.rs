//! Sunrise/sunset arithmetic.
//!
//! The power limiter's nighttime discharge latch and the behind-meter
//! correction both need to know whether it is currently day. We compute the
//! solar elevation angle from declination and hour angle for the configured
//! location; the sun counts as up while the elevation is above the standard
//! horizon offset (upper limb plus atmospheric refraction).

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Elevation below which the sun counts as set, in degrees.
const HORIZON_OFFSET_DEG: f64 = -0.833;

#[derive(Debug, Clone)]
pub enum SunPosition {
    Computed { latitude_deg: f64, longitude_deg: f64 },
    /// Day period pinned to a constant.
    Fixed(bool),
    /// Day period driven externally, e.g. by tests.
    Shared(Arc<AtomicBool>),
}

impl SunPosition {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self::Computed { latitude_deg, longitude_deg }
    }

    pub fn fixed(is_day: bool) -> Self {
        Self::Fixed(is_day)
    }

    pub fn shared(flag: Arc<AtomicBool>) -> Self {
        Self::Shared(flag)
    }

    pub fn is_day_period(&self) -> bool {
        self.is_day_period_at(Utc::now())
    }

    pub fn is_day_period_at(&self, time: DateTime<Utc>) -> bool {
        match self {
            Self::Fixed(day) => *day,
            Self::Shared(flag) => flag.load(Ordering::Relaxed),
            Self::Computed { latitude_deg, longitude_deg } => {
                solar_elevation_deg(*latitude_deg, *longitude_deg, time) > HORIZON_OFFSET_DEG
            }
        }
    }
}

/// Solar elevation above the horizon in degrees for the given location and
/// instant. 0 = at the horizon, 90 = directly overhead.
pub fn solar_elevation_deg(latitude_deg: f64, longitude_deg: f64, time: DateTime<Utc>) -> f64 {
    let day_of_year = time.ordinal() as f64;
    let hour = time.hour() as f64 + time.minute() as f64 / 60.0;

    // Solar declination: -23.45 deg at winter solstice, +23.45 deg at summer
    // solstice.
    let declination_rad =
        (23.45 * (360.0 / 365.0 * (day_of_year + 284.0) * PI / 180.0).sin()) * PI / 180.0;
    let latitude_rad = latitude_deg * PI / 180.0;

    // Hour angle relative to solar noon, from apparent solar time.
    let solar_time = hour + longitude_deg / 15.0;
    let hour_angle_rad = 15.0 * (solar_time - 12.0) * PI / 180.0;

    let elevation_sin = latitude_rad.sin() * declination_rad.sin()
        + latitude_rad.cos() * declination_rad.cos() * hour_angle_rad.cos();

    elevation_sin.asin() * 180.0 / PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn equator_noon_is_day() {
        let sun = SunPosition::new(0.0, 0.0);
        let noon = Utc.with_ymd_and_hms(2024, 3, 21, 12, 0, 0).unwrap();
        assert!(sun.is_day_period_at(noon));
    }

    #[test]
    fn equator_midnight_is_night() {
        let sun = SunPosition::new(0.0, 0.0);
        let midnight = Utc.with_ymd_and_hms(2024, 3, 21, 0, 0, 0).unwrap();
        assert!(!sun.is_day_period_at(midnight));
    }

    #[test]
    fn northern_summer_evening_is_still_day() {
        // Berlin, ~19:00 UTC in June: sun is still up.
        let sun = SunPosition::new(52.5, 13.4);
        let evening = Utc.with_ymd_and_hms(2024, 6, 21, 19, 0, 0).unwrap();
        assert!(sun.is_day_period_at(evening));
    }

    #[test]
    fn fixed_override_wins() {
        let night = Utc.with_ymd_and_hms(2024, 3, 21, 0, 0, 0).unwrap();
        assert!(SunPosition::fixed(true).is_day_period_at(night));
        assert!(!SunPosition::fixed(false).is_day_period_at(night));
    }
}
