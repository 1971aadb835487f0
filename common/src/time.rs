//! The collector's notion of time: a per-iteration wall clock and the
//! aligned deadline driving periodic dumps.

use std::time::Duration;

use chrono::{DateTime, Local};

/// Maximum amount of time to wait for i/o when no dump deadline bounds
/// the poll.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Dump deadlines are aligned to this wall-clock unit.
const ROUNDOFF_SECS: i64 = 60;

/// Wall clock refreshed once per reactor iteration, so every consumer of
/// a single iteration observes the same instant.
#[derive(Debug, Clone)]
pub struct Clock {
    now: DateTime<Local>,
    since_epoch: bool,
}

impl Clock {
    pub fn new(since_epoch: bool) -> Self {
        Self {
            now: Local::now(),
            since_epoch,
        }
    }

    /// Re-read the wall clock.
    pub fn refresh(&mut self) {
        self.now = Local::now();
    }

    pub fn now(&self) -> DateTime<Local> {
        self.now
    }

    /// Seconds since the epoch, as of the last refresh.
    pub fn secs(&self) -> i64 {
        self.now.timestamp()
    }

    /// Render the current timestamp the way emitted records carry it:
    /// epoch seconds with microseconds, or ISO 8601.
    pub fn render(&self) -> String {
        if self.since_epoch {
            format!(
                "{}.{:06}",
                self.now.timestamp(),
                self.now.timestamp_subsec_micros()
            )
        } else {
            self.now.format("%Y-%m-%dT%H:%M:%S%.6f%z").to_string()
        }
    }
}

/// Periodic dump deadline, aligned to minute boundaries.
///
/// Initialization rounds "now" down to the minute, advances by whole
/// periods while still more than one period behind, then lands one period
/// ahead; the first dump never fires earlier than one period past the
/// last crossed boundary. The deadline is strictly in the future after
/// every reactor iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpTimer {
    deadline: i64,
    period: i64,
}

impl DumpTimer {
    pub fn new(now: i64, period: i64) -> Self {
        debug_assert!(period > 0);

        let mut base = now - now.rem_euclid(ROUNDOFF_SECS);
        while base + period < now {
            base += period;
        }
        Self {
            deadline: base + period,
            period,
        }
    }

    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    /// True whenever at least one boundary has been crossed; the caller
    /// fires one dump per crossed boundary and advances explicitly.
    pub fn due(&self, now: i64) -> bool {
        now > self.deadline
    }

    /// Move past one crossed boundary.
    pub fn advance(&mut self) {
        self.deadline += self.period;
    }

    /// Time remaining until the deadline, as a poll timeout.
    pub fn timeout(&self, now: i64) -> Duration {
        Duration::from_secs((self.deadline - now).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_on_minute_boundary_is_one_period_out() {
        // 2021-06-01 12:00:00 UTC.
        let t0 = 1622548800;
        assert_eq!(t0 % 60, 0);

        let timer = DumpTimer::new(t0, 60);
        assert_eq!(timer.deadline(), t0 + 60);
    }

    #[test]
    fn deadline_mid_minute_lands_on_next_boundary() {
        let t0 = 1622548800;
        let timer = DumpTimer::new(t0 + 30, 60);
        assert_eq!(timer.deadline(), t0 + 60);

        // Sub-minute periods advance from the rounded base.
        let timer = DumpTimer::new(t0 + 35, 10);
        assert_eq!(timer.deadline(), t0 + 40);
    }

    #[test]
    fn deadline_is_always_in_the_future() {
        let t0 = 1622548800;
        for offset in 0..180 {
            let now = t0 + offset;
            let timer = DumpTimer::new(now, 60);
            assert!(timer.deadline() > now, "offset {}", offset);
        }
    }

    #[test]
    fn due_is_strict_and_advance_catches_up() {
        let t0 = 1622548800;
        let mut timer = DumpTimer::new(t0, 60);

        assert!(!timer.due(t0 + 60));
        assert!(timer.due(t0 + 61));

        // Three boundaries crossed at once: three dumps, then quiescent.
        let late = t0 + 200;
        let mut fired = 0;
        while timer.due(late) {
            fired += 1;
            timer.advance();
        }
        assert_eq!(fired, 3);
        assert!(timer.deadline() > late);
    }

    #[test]
    fn timeout_never_goes_negative() {
        let t0 = 1622548800;
        let timer = DumpTimer::new(t0, 60);
        assert_eq!(timer.timeout(t0), Duration::from_secs(60));
        assert_eq!(timer.timeout(t0 + 59), Duration::from_secs(1));
        assert_eq!(timer.timeout(t0 + 300), Duration::from_secs(0));
    }

    #[test]
    fn clock_renders_epoch_and_iso() {
        let clock = Clock::new(true);
        let epoch = clock.render();
        assert!(epoch.contains('.'));
        assert!(epoch.split('.').next().unwrap().parse::<i64>().is_ok());

        let clock = Clock::new(false);
        assert!(clock.render().contains('T'));
    }
}
