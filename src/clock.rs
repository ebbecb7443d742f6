use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// # Clock
/// Every polling loop in the bench (status until terminal, power convergence, calibration leveling,
/// timed acquisitions) reads time and sleeps through a Clock, so that the loops can be driven by
/// simulated time in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock, sleeps the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// # ManualClock
/// Simulated clock. Sleeping advances the simulated time instantly. Transports used in tests
/// also advance it when they "wait" for a poll timeout.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self { origin: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += duration;
        }
    }

    /// Total simulated time since creation
    pub fn elapsed(&self) -> Duration {
        match self.offset.lock() {
            Ok(offset) => *offset,
            Err(_) => Duration::ZERO,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(2));
        clock.sleep(Duration::from_millis(500));
        assert_eq!(clock.elapsed_since(start), Duration::from_millis(2500));
        assert_eq!(clock.elapsed(), Duration::from_millis(2500));
    }
}
