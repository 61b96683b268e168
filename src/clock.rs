//! Module that contains the Lamport clock used to order requests.

use crate::error::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Struct that represents a Lamport timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTimestamp(pub u64);

impl LogicalTimestamp {
    /// Value every clock starts at.
    pub const START: Self = Self(1);
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Struct that represents the local logical clock of a peer.
///
/// Every event leaves the clock at `max(local, observed) + 1`, where `observed`
/// is zero for purely local events. An event that would go past `u64::MAX` is
/// refused and leaves the clock untouched.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    current: LogicalTimestamp,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            current: LogicalTimestamp::START,
        }
    }

    /// Function that returns the current timestamp without advancing the clock.
    pub fn now(&self) -> LogicalTimestamp {
        self.current
    }

    /// Function that advances the clock for a local event.
    pub fn tick(&mut self) -> Result<LogicalTimestamp, Violation> {
        self.observe(LogicalTimestamp(0))
    }

    /// Function that advances the clock past a timestamp carried by a message.
    pub fn observe(&mut self, remote: LogicalTimestamp) -> Result<LogicalTimestamp, Violation> {
        let next = self
            .current
            .0
            .max(remote.0)
            .checked_add(1)
            .ok_or(Violation::ClockOverflow(remote))?;
        self.current = LogicalTimestamp(next);
        Ok(self.current)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        assert_eq!(LogicalClock::new().now(), LogicalTimestamp(1));
    }

    #[test]
    fn tick_increments() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), Ok(LogicalTimestamp(2)));
        assert_eq!(clock.tick(), Ok(LogicalTimestamp(3)));
        assert_eq!(clock.now(), LogicalTimestamp(3));
    }

    #[test]
    fn observe_takes_max_plus_one() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.observe(LogicalTimestamp(10)), Ok(LogicalTimestamp(11)));
        // an older remote timestamp still advances the clock
        assert_eq!(clock.observe(LogicalTimestamp(3)), Ok(LogicalTimestamp(12)));
    }

    #[test]
    fn never_decreases() {
        let mut clock = LogicalClock::new();
        let mut last = clock.now();
        for remote in [0, 7, 2, 2, 40, 1, 0, 41, 39] {
            let next = if remote % 2 == 0 {
                clock.tick()
            } else {
                clock.observe(LogicalTimestamp(remote))
            }
            .unwrap();
            assert!(next > last, "{next} should be after {last}");
            last = next;
        }
    }

    #[test]
    fn overflow_is_refused_without_moving_the_clock() {
        let mut clock = LogicalClock::new();
        let last = LogicalTimestamp(u64::MAX);
        assert_eq!(clock.observe(last), Err(Violation::ClockOverflow(last)));
        assert_eq!(clock.now(), LogicalTimestamp(1));

        assert_eq!(
            clock.observe(LogicalTimestamp(u64::MAX - 1)),
            Ok(LogicalTimestamp(u64::MAX))
        );
        assert_eq!(
            clock.tick(),
            Err(Violation::ClockOverflow(LogicalTimestamp(0)))
        );
        assert_eq!(clock.now(), LogicalTimestamp(u64::MAX));
    }
}
