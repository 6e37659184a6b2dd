use std::{thread, time::Duration};

use bma_ts::Monotonic;

/// A synchronous fixed-period interval, similar to
/// <https://docs.rs/tokio/latest/tokio/time/struct.Interval.html> but with a
/// single missed-tick policy: a deadline in the past is skipped, never
/// replayed, and the next deadline stays on the original monotonic grid.
pub struct Interval {
    next_tick: Option<Monotonic>,
    period: Duration,
}

impl Interval {
    /// Creates a new interval with the given period
    pub fn new(period: Duration) -> Self {
        Self {
            next_tick: None,
            period,
        }
    }
    /// The interval period
    pub fn period(&self) -> Duration {
        self.period
    }
    /// Sleeps until the next deadline on the monotonic clock.
    ///
    /// Returns false if the deadline had already passed when called (cycle
    /// overrun); in that case no sleep is performed and all missed deadlines
    /// are skipped.
    pub fn tick(&mut self) -> bool {
        let now = Monotonic::now();
        let Some(next_tick) = self.next_tick else {
            self.next_tick = Some(now + self.period);
            return true;
        };
        if now < next_tick {
            self.next_tick = Some(next_tick + self.period);
            thread::sleep(next_tick - now);
            true
        } else {
            let mut next_tick = next_tick;
            while next_tick <= now {
                next_tick = next_tick + self.period;
            }
            self.next_tick = Some(next_tick);
            false
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bma_ts::Monotonic;

    use super::Interval;

    #[test]
    fn test_tick_cadence() {
        let start = Monotonic::now();
        let mut interval = Interval::new(Duration::from_millis(10));
        for _ in 0..3 {
            assert!(interval.tick());
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[test]
    fn test_overrun_is_skipped() {
        let mut interval = Interval::new(Duration::from_millis(5));
        assert!(interval.tick());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!interval.tick());
        // the grid is intact: the following tick waits for a future deadline
        assert!(interval.tick());
    }
}
