use std::time::{Duration, Instant};

/// A monotonic countdown timer which remembers its interval.
///
/// Timers never fire on their own; the owner checks `is_expired` from the
/// periodic tick.
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
    interval: Duration,
}

impl Timer {
    /// Creates a timer and starts it with the given interval.
    pub fn new(interval: Duration) -> Timer {
        Timer {
            start: Instant::now(),
            interval,
        }
    }

    /// Restarts the timer with a new interval.
    pub fn start(&mut self, interval: Duration) {
        self.interval = interval;
        self.start = Instant::now();
    }

    /// Restarts the timer with its current interval.
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.interval
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

pub fn duration_to_ms(duration: &Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}
