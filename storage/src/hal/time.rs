//! Deadlines and bounded register polling.
//!
//! All waits are bounded twice: by a tick deadline derived from the HAL's
//! calibrated rate, and by a hard iteration cap so a stuck clock cannot hang
//! bring-up.

use super::Hal;

/// Absolute point in HAL ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(u64);

impl Deadline {
    /// Deadline `ms` milliseconds from now.
    pub fn after_ms(hal: &dyn Hal, ms: u64) -> Self {
        let delta = ms.saturating_mul(hal.ticks_per_ms());
        Self(hal.ticks().saturating_add(delta))
    }

    /// Deadline at an absolute tick value.
    pub const fn at(ticks: u64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(&self) -> u64 {
        self.0
    }

    pub fn has_passed(&self, now: u64) -> bool {
        now >= self.0
    }

    pub fn expired(&self, hal: &dyn Hal) -> bool {
        self.has_passed(hal.ticks())
    }
}

/// Poll `done` until it returns true, the deadline passes or the iteration
/// cap is hit. Calls `Hal::relax` between attempts.
///
/// Returns whether the condition was observed.
pub fn poll_until<F>(hal: &dyn Hal, timeout_ms: u64, max_iterations: u32, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Deadline::after_ms(hal, timeout_ms);

    for _ in 0..max_iterations {
        if done() {
            return true;
        }
        if deadline.expired(hal) {
            // One last look; the bit may have flipped while we checked time.
            return done();
        }
        hal.relax();
    }

    done()
}
