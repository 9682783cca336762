use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// A point in time, in milliseconds since the epoch of the [`Clock`] that produced it.
///
/// Ticks from different clocks are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(pub u64);

impl Tick {
    /// The tick `duration` after this one, saturating.
    pub fn after(self, duration: Duration) -> Tick {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Tick(self.0.saturating_add(millis))
    }

    /// The duration from `earlier` until this tick, or zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Tick) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A monotonic millisecond clock.
///
/// This is built on [`tokio::time::Instant`], so paused tokio time in tests also pauses the
/// clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// The current tick.
    pub fn now(&self) -> Tick {
        let millis = self.epoch.elapsed().as_millis();
        Tick(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
