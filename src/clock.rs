// src/clock.rs
//! Wall-clock source for onset and resize timestamps.
//!
//! Production uses `SystemClock`; tests drive a `TestClock` by hand.

use std::time::SystemTime;

pub trait Clock: Send + Sync {
    /// Seconds since the UNIX epoch, with sub-second precision.
    fn unix_seconds(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
pub use test_clock::TestClock;
