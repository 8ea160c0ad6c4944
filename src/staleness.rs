//! Refresh scheduling for cached measurement data.
//!
//! A device's cached data is *stale* once its age exceeds the poll interval
//! for the device's current mode: a short interval with elevated priority in
//! fast mode, a long interval with regular priority otherwise. Two streams
//! are cached per device (frequency measurement and OSA trace); the earlier
//! of their two timestamps governs, so a refresh is requested as soon as
//! either stream is stale.
//!
//! Everything in here is a pure function of its inputs. The sync loop feeds
//! it monotonic [`Instant`]s; tests feed it fabricated ones.

use crate::config::PollingSettings;
use std::time::Duration;
use tokio::time::Instant;

/// Measurement priority for a device in fast mode. The control server's
/// scheduler serves smaller values first.
pub const FAST_MODE_PRIORITY: u8 = 2;

/// Measurement priority for regular background updates.
pub const REGULAR_UPDATE_PRIORITY: u8 = 3;

/// Poll cadence for one device, derived from its fast-mode flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollMode {
    /// Short interval, higher scheduling priority.
    Fast,
    /// Long interval, background priority.
    Regular,
}

impl PollMode {
    /// Mode for a device whose `fast_mode` setting is `fast`.
    pub fn from_fast_mode(fast: bool) -> Self {
        if fast {
            PollMode::Fast
        } else {
            PollMode::Regular
        }
    }

    /// Poll interval for this mode.
    pub fn interval(self, polling: &PollingSettings) -> Duration {
        match self {
            PollMode::Fast => polling.poll_time_fast,
            PollMode::Regular => polling.poll_time,
        }
    }

    /// Scheduling priority passed through to the control server.
    pub fn priority(self) -> u8 {
        match self {
            PollMode::Fast => FAST_MODE_PRIORITY,
            PollMode::Regular => REGULAR_UPDATE_PRIORITY,
        }
    }
}

/// Remaining wait until data last refreshed at `last` is due again.
///
/// Returns [`Duration::ZERO`] exactly when `now - last >= poll_interval`,
/// i.e. a zero result means "refresh now". For a fixed `last` the result is
/// monotonically non-increasing as `now` advances.
pub fn time_until_due(last: Instant, poll_interval: Duration, now: Instant) -> Duration {
    (last + poll_interval).saturating_duration_since(now)
}

/// The timestamp that governs staleness across the two cached streams.
///
/// The earlier timestamp wins. A stream with no data yet returns `None`
/// overall, meaning a refresh is due immediately.
pub fn governing_timestamp(frequency: Option<Instant>, trace: Option<Instant>) -> Option<Instant> {
    match (frequency, trace) {
        (Some(f), Some(t)) => Some(f.min(t)),
        _ => None,
    }
}

/// Remaining wait until the next measurement request for a device whose
/// frequency and trace streams were last refreshed at the given instants.
pub fn next_refresh_in(
    frequency: Option<Instant>,
    trace: Option<Instant>,
    poll_interval: Duration,
    now: Instant,
) -> Duration {
    match governing_timestamp(frequency, trace) {
        Some(governing) => time_until_due(governing, poll_interval, now),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn due_exactly_when_interval_elapsed() {
        let last = Instant::now();

        // One nanosecond short of the interval: not yet due.
        let almost = last + INTERVAL - Duration::from_nanos(1);
        assert!(time_until_due(last, INTERVAL, almost) > Duration::ZERO);

        // At and past the interval: due.
        assert_eq!(time_until_due(last, INTERVAL, last + INTERVAL), Duration::ZERO);
        let late = last + INTERVAL + Duration::from_secs(1);
        assert_eq!(time_until_due(last, INTERVAL, late), Duration::ZERO);
    }

    #[test]
    fn remaining_wait_decreases_as_now_advances() {
        let last = Instant::now();
        let mut previous = time_until_due(last, INTERVAL, last);
        for step in 1..=10 {
            let now = last + Duration::from_millis(step * 700);
            let remaining = time_until_due(last, INTERVAL, now);
            assert!(remaining <= previous);
            previous = remaining;
        }
        assert_eq!(previous, Duration::ZERO);
    }

    #[test]
    fn earlier_stream_governs() {
        let older = Instant::now();
        let newer = older + Duration::from_secs(3);
        assert_eq!(governing_timestamp(Some(older), Some(newer)), Some(older));
        assert_eq!(governing_timestamp(Some(newer), Some(older)), Some(older));
    }

    #[test]
    fn missing_stream_means_due_now() {
        let now = Instant::now();
        assert_eq!(next_refresh_in(None, None, INTERVAL, now), Duration::ZERO);
        assert_eq!(next_refresh_in(Some(now), None, INTERVAL, now), Duration::ZERO);
        assert_eq!(next_refresh_in(None, Some(now), INTERVAL, now), Duration::ZERO);
    }

    #[test]
    fn next_refresh_tracks_the_older_stream() {
        let start = Instant::now();
        let freq = start + Duration::from_secs(2);
        let osa = start + Duration::from_secs(4);
        let now = start + Duration::from_secs(4);

        // The frequency reading is 2 s old, so 3 s of the 5 s interval remain.
        let remaining = next_refresh_in(Some(freq), Some(osa), INTERVAL, now);
        assert_eq!(remaining, Duration::from_secs(3));
    }

    #[test]
    fn fast_mode_selects_short_interval_and_urgent_priority() {
        let polling = PollingSettings {
            poll_time: Duration::from_secs(5),
            poll_time_fast: Duration::from_millis(500),
            error_backoff: Duration::from_millis(100),
        };

        let fast = PollMode::from_fast_mode(true);
        let regular = PollMode::from_fast_mode(false);

        assert_eq!(fast.interval(&polling), Duration::from_millis(500));
        assert_eq!(regular.interval(&polling), Duration::from_secs(5));

        // Smaller value = served first.
        assert!(fast.priority() < regular.priority());
        assert_eq!(fast.priority(), FAST_MODE_PRIORITY);
        assert_eq!(regular.priority(), REGULAR_UPDATE_PRIORITY);
    }
}
