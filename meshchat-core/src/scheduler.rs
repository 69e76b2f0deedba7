//! Announce/housekeeping cadence. The host owns the timer; the router owns the work
//! (see `Router::tick`).

use std::time::Duration;

/// Delay between service start and the first tick.
pub const ANNOUNCE_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Period of the announce/housekeeping tick.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// When the recurring tick fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl AnnounceSchedule {
    /// Zero periods are bumped to one second so a misconfigured host cannot spin.
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period: period.max(Duration::from_secs(1)),
        }
    }

    /// Offset of the n-th tick (0-based) from service start.
    pub fn nth_tick(&self, n: u32) -> Duration {
        self.initial_delay + self.period * n
    }
}

impl Default for AnnounceSchedule {
    fn default() -> Self {
        Self::new(ANNOUNCE_INITIAL_DELAY, ANNOUNCE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cadence() {
        let s = AnnounceSchedule::default();
        assert_eq!(s.nth_tick(0), Duration::from_secs(5));
        assert_eq!(s.nth_tick(1), Duration::from_secs(35));
        assert_eq!(s.nth_tick(2), Duration::from_secs(65));
    }

    #[test]
    fn zero_period_bumped() {
        let s = AnnounceSchedule::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(s.period, Duration::from_secs(1));
    }
}
