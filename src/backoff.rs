use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Maximum reconnect backoff mandated by E1.33.
pub const BACKOFF_MAX_MS: u64 = 30_000;

const BACKOFF_INCREMENT_MIN_MS: u64 = 1_000;
const BACKOFF_INCREMENT_MAX_MS: u64 = 5_000;

/// Tracker for the E1.33 reconnect backoff.
///
/// Each failed attempt grows the interval by a uniformly random 1–5 seconds,
/// clamped at 30 seconds. A successful connection resets the interval to
/// zero, so the first attempt of a fresh session never waits.
#[derive(Debug)]
pub struct Backoff {
    current_ms: u64,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff { current_ms: 0 }
    }

    /// Grows the interval and returns the new value.
    pub fn next_backoff_ms(&mut self) -> u64 {
        let increment = rand::thread_rng().gen_range(BACKOFF_INCREMENT_MIN_MS..=BACKOFF_INCREMENT_MAX_MS);
        self.current_ms = cmp::min(self.current_ms + increment, BACKOFF_MAX_MS);
        self.current_ms
    }

    /// Grows the interval and returns the new value as a `Duration`.
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    pub fn reset(&mut self) {
        self.current_ms = 0;
    }
}
