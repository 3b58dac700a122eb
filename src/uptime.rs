//! Monotone uptime clock with 32-bit wraparound semantics.
//!
//! All age and interval bookkeeping in this crate uses a `u32` millisecond
//! counter that wraps roughly every 49.7 days, and wrap-safe subtraction:
//! `(a - b) < HALF_RANGE` denotes "a is at or after b". Raw uptimes must
//! never be compared with `<`.

use chrono::Datelike;
use once_cell::sync::Lazy;
use std::time::Instant;

pub const HALF_RANGE: u32 = u32::MAX / 2;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start, wrapping at `u32::MAX`.
pub fn millis() -> u32 {
    EPOCH.elapsed().as_millis() as u32
}

/// Wrap-safe "is `a` at or after `b`".
pub fn at_or_after(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < HALF_RANGE
}

/// Wrap-safe elapsed milliseconds from `since` to `now`.
pub fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Seconds elapsed since `since`, evaluated against the live clock.
pub fn age_seconds(since: u32) -> u32 {
    elapsed(millis(), since) / 1000
}

/// Whether the wall clock carries a plausible, synchronized date. Commands
/// that depend on local time (inverter restart scheduling, nighttime
/// detection) are withheld until this holds.
pub fn wall_clock_valid() -> bool {
    chrono::Local::now().year() >= 2020
}
