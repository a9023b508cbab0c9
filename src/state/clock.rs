//! Game clock represented as an anchor instead of a ticking counter.
//!
//! Devices never decrement a local timer: they all derive the displayed value
//! from the broadcast `(value, timestamp)` pair, so two readers agree exactly
//! for the same `now`.

use std::time::Duration;

use time::OffsetDateTime;

/// Countdown clock anchored to a wall-clock instant while running.
///
/// `anchor_timestamp` is `Some` exactly when the clock is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnchor {
    value_at_anchor: Duration,
    anchor_timestamp: Option<OffsetDateTime>,
}

impl ClockAnchor {
    /// A stopped clock showing `value`.
    pub fn stopped(value: Duration) -> Self {
        Self {
            value_at_anchor: value,
            anchor_timestamp: None,
        }
    }

    /// A clock that was started at `anchor` showing `value`.
    pub fn running(value: Duration, anchor: OffsetDateTime) -> Self {
        Self {
            value_at_anchor: value,
            anchor_timestamp: Some(anchor),
        }
    }

    /// Whether the clock is counting down.
    pub fn is_running(&self) -> bool {
        self.anchor_timestamp.is_some()
    }

    /// Value captured when the anchor was taken.
    pub fn value_at_anchor(&self) -> Duration {
        self.value_at_anchor
    }

    /// Instant the running clock was anchored at.
    pub fn anchor_timestamp(&self) -> Option<OffsetDateTime> {
        self.anchor_timestamp
    }

    /// Clock value at `now`. Pure: never mutates the anchor.
    ///
    /// A `now` earlier than the anchor (skewed peer clock) reads as zero elapsed time.
    pub fn current_value(&self, now: OffsetDateTime) -> Duration {
        match self.anchor_timestamp {
            Some(anchor) => {
                let elapsed = Duration::try_from(now - anchor).unwrap_or(Duration::ZERO);
                self.value_at_anchor.saturating_sub(elapsed)
            }
            None => self.value_at_anchor,
        }
    }

    /// Start counting down from the currently displayed value. Returns `false` if already running.
    pub fn start(&mut self, now: OffsetDateTime) -> bool {
        if self.is_running() {
            return false;
        }
        self.value_at_anchor = self.current_value(now);
        self.anchor_timestamp = Some(now);
        true
    }

    /// Freeze the clock at its current value. Returns `false` if already stopped.
    pub fn stop(&mut self, now: OffsetDateTime) -> bool {
        if !self.is_running() {
            return false;
        }
        self.value_at_anchor = self.current_value(now);
        self.anchor_timestamp = None;
        true
    }

    /// Replace the value of a stopped clock. Returns `false` while running.
    pub fn set(&mut self, value: Duration) -> bool {
        if self.is_running() {
            return false;
        }
        self.value_at_anchor = value;
        true
    }

    /// Whether a running clock has reached zero at `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.is_running() && self.current_value(now).is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::from_millis;

    fn at(ms: i64) -> OffsetDateTime {
        from_millis(1_700_000_000_000 + ms)
    }

    #[test]
    fn stopped_clock_reads_its_value() {
        let clock = ClockAnchor::stopped(Duration::from_secs(600));
        assert_eq!(clock.current_value(at(99_000)), Duration::from_secs(600));
        assert!(!clock.is_running());
        assert_eq!(clock.anchor_timestamp(), None);
    }

    #[test]
    fn running_clock_counts_down_from_anchor() {
        let mut clock = ClockAnchor::stopped(Duration::from_secs(600));
        assert!(clock.start(at(0)));
        assert_eq!(
            clock.current_value(at(12_500)),
            Duration::from_millis(587_500)
        );
    }

    #[test]
    fn reading_is_idempotent_for_the_same_instant() {
        let clock = ClockAnchor::running(Duration::from_secs(90), at(0));
        let now = at(33_333);
        assert_eq!(clock.current_value(now), clock.current_value(now));
        assert_eq!(clock, ClockAnchor::running(Duration::from_secs(90), at(0)));
    }

    #[test]
    fn value_never_goes_below_zero() {
        let clock = ClockAnchor::running(Duration::from_secs(5), at(0));
        assert_eq!(clock.current_value(at(60_000)), Duration::ZERO);
        assert!(clock.is_expired(at(60_000)));
    }

    #[test]
    fn skewed_now_before_anchor_reads_full_value() {
        let clock = ClockAnchor::running(Duration::from_secs(5), at(10_000));
        assert_eq!(clock.current_value(at(0)), Duration::from_secs(5));
    }

    #[test]
    fn stop_then_start_resumes_where_it_stopped() {
        let mut clock = ClockAnchor::stopped(Duration::from_secs(600));
        clock.start(at(0));
        assert!(clock.stop(at(10_000)));
        assert_eq!(clock.value_at_anchor(), Duration::from_secs(590));
        assert_eq!(clock.anchor_timestamp(), None);

        assert!(clock.start(at(50_000)));
        assert_eq!(clock.current_value(at(55_000)), Duration::from_secs(585));
    }

    #[test]
    fn repeated_start_or_stop_is_a_no_op() {
        let mut clock = ClockAnchor::stopped(Duration::from_secs(10));
        assert!(!clock.stop(at(0)));
        clock.start(at(0));
        assert!(!clock.start(at(3_000)));
        assert_eq!(clock.anchor_timestamp(), Some(at(0)));
    }

    #[test]
    fn set_is_refused_while_running() {
        let mut clock = ClockAnchor::running(Duration::from_secs(10), at(0));
        assert!(!clock.set(Duration::from_secs(20)));
        clock.stop(at(1_000));
        assert!(clock.set(Duration::from_secs(20)));
        assert_eq!(clock.current_value(at(5_000)), Duration::from_secs(20));
    }
}
