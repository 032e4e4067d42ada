use crate::Tick;
use std::time::{Duration, Instant, SystemTime};

/// Number of ticks per wall clock second.
pub const TICKS_PER_SECOND: u64 = 60;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Converts wall clock time into ticks, starting from zero at construction.
pub struct TickClock {
    start: Instant,
}

impl TickClock {
    #[inline]
    pub fn new() -> TickClock {
        TickClock { start: Instant::now() }
    }

    /// Number of ticks elapsed since the clock was started.
    #[inline]
    pub fn now(&self) -> Tick {
        Self::to_ticks(self.start.elapsed())
    }

    /// Time remaining until the supplied tick is reached, zero if it has already passed.
    #[inline]
    pub fn until(&self, tick: Tick) -> Duration {
        Self::to_duration(tick).checked_sub(self.start.elapsed()).unwrap_or_default()
    }

    #[inline]
    pub fn to_ticks(duration: Duration) -> Tick {
        (duration.as_micros() * u128::from(TICKS_PER_SECOND) / 1_000_000) as Tick
    }

    #[inline]
    pub fn to_duration(ticks: Tick) -> Duration {
        Duration::from_micros(ticks * 1_000_000 / TICKS_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_conversion() {
        assert_eq!(TickClock::to_ticks(Duration::from_secs(2)), 2 * TICKS_PER_SECOND);
        assert_eq!(TickClock::to_ticks(Duration::from_millis(10)), 0);
        assert_eq!(TickClock::to_duration(TICKS_PER_SECOND), Duration::from_secs(1));
    }

    #[test]
    fn test_until_elapsed() {
        let clock = TickClock::new();
        assert_eq!(clock.until(0), Duration::from_secs(0));
    }
}
