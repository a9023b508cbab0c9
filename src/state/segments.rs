use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::time_source::{from_millis, to_millis};

/// Contiguous interval during which the tracked player stayed on court or on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSegment {
    #[serde(with = "millis")]
    pub start_time: OffsetDateTime,
    #[serde(with = "optional_millis")]
    pub end_time: Option<OffsetDateTime>,
    pub is_on_court: bool,
}

impl TimeSegment {
    /// Length of the segment, measuring an open segment up to `now`.
    pub fn duration(&self, now: OffsetDateTime) -> Duration {
        let end = self.end_time.unwrap_or(now);
        Duration::try_from(end - self.start_time).unwrap_or(Duration::ZERO)
    }

    /// Whether the segment is still running.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Court/bench timeline: closed segments followed by at most one open segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeTracker {
    segments: Vec<TimeSegment>,
}

impl TimeTracker {
    /// Rebuild a tracker from received segments. Every segment but the last is force-closed
    /// at the start of its successor so at most one stays open.
    pub fn from_segments(mut segments: Vec<TimeSegment>) -> Self {
        let starts = segments
            .iter()
            .skip(1)
            .map(|segment| segment.start_time)
            .collect::<Vec<_>>();
        for (segment, next_start) in segments.iter_mut().zip(starts) {
            if segment.end_time.is_none() {
                segment.end_time = Some(next_start);
            }
        }
        Self { segments }
    }

    /// Every segment in chronological order.
    pub fn segments(&self) -> &[TimeSegment] {
        &self.segments
    }

    /// The open segment, if any.
    pub fn open_segment(&self) -> Option<&TimeSegment> {
        self.segments.last().filter(|segment| segment.is_open())
    }

    /// Current flag of the open segment.
    pub fn is_on_court(&self) -> Option<bool> {
        self.open_segment().map(|segment| segment.is_on_court)
    }

    /// Switch the player on or off court. Returns `false` when the flag is unchanged.
    pub fn set_on_court(&mut self, on_court: bool, now: OffsetDateTime) -> bool {
        if self.is_on_court() == Some(on_court) {
            return false;
        }
        self.close_open(now);
        self.segments.push(TimeSegment {
            start_time: now,
            end_time: None,
            is_on_court: on_court,
        });
        true
    }

    /// Close the open segment at `at`, if one exists.
    pub fn close_open(&mut self, at: OffsetDateTime) {
        if let Some(open) = self.segments.last_mut().filter(|segment| segment.is_open()) {
            open.end_time = Some(at.max(open.start_time));
        }
    }

    /// Time spent on court, including the open segment when it is an on-court one.
    pub fn total_court(&self, now: OffsetDateTime) -> Duration {
        self.total_for(true, now)
    }

    /// Time spent on the bench, including the open segment when it is a bench one.
    pub fn total_bench(&self, now: OffsetDateTime) -> Duration {
        self.total_for(false, now)
    }

    /// Minutes on court, as displayed on the scorer's sheet.
    pub fn total_court_minutes(&self, now: OffsetDateTime) -> f64 {
        self.total_court(now).as_secs_f64() / 60.0
    }

    /// Minutes on the bench.
    pub fn total_bench_minutes(&self, now: OffsetDateTime) -> f64 {
        self.total_bench(now).as_secs_f64() / 60.0
    }

    fn total_for(&self, on_court: bool, now: OffsetDateTime) -> Duration {
        self.segments
            .iter()
            .filter(|segment| segment.is_on_court == on_court)
            .map(|segment| segment.duration(now))
            .sum()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(super::to_millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        i64::deserialize(deserializer).map(super::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_some(&super::to_millis(*at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        Option::<i64>::deserialize(deserializer).map(|value| value.map(super::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        from_millis(1_700_000_000_000 + secs * 1_000)
    }

    fn open_count(tracker: &TimeTracker) -> usize {
        tracker.segments().iter().filter(|s| s.is_open()).count()
    }

    #[test]
    fn repeated_flag_is_a_no_op() {
        let mut tracker = TimeTracker::default();
        assert!(tracker.set_on_court(true, at(0)));
        assert!(!tracker.set_on_court(true, at(5)));
        assert_eq!(tracker.segments().len(), 1);
        assert_eq!(open_count(&tracker), 1);
    }

    #[test]
    fn switching_closes_the_previous_segment() {
        let mut tracker = TimeTracker::default();
        tracker.set_on_court(false, at(0));
        tracker.set_on_court(true, at(60));
        tracker.set_on_court(false, at(300));

        let segments = tracker.segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].end_time, Some(at(60)));
        assert_eq!(segments[1].end_time, Some(at(300)));
        assert!(segments[2].is_open());
        assert_eq!(open_count(&tracker), 1);
    }

    #[test]
    fn totals_include_the_open_segment() {
        let mut tracker = TimeTracker::default();
        tracker.set_on_court(false, at(0));
        tracker.set_on_court(true, at(60));

        assert_eq!(tracker.total_bench(at(180)), Duration::from_secs(60));
        assert_eq!(tracker.total_court(at(180)), Duration::from_secs(120));
        assert!((tracker.total_court_minutes(at(180)) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn totals_add_up_to_elapsed_wall_time() {
        let mut tracker = TimeTracker::default();
        let flips = [(0, true), (7, false), (7, false), (19, true), (40, true), (41, false)];
        for (second, flag) in flips {
            tracker.set_on_court(flag, at(second));
            assert!(open_count(&tracker) <= 1);
        }

        for now in [41, 50, 100] {
            let total = tracker.total_court(at(now)) + tracker.total_bench(at(now));
            assert_eq!(total, Duration::from_secs(now as u64));
        }
        assert!(
            tracker.total_court(at(101)) + tracker.total_bench(at(101))
                > tracker.total_court(at(100)) + tracker.total_bench(at(100))
        );
    }

    #[test]
    fn close_open_freezes_totals() {
        let mut tracker = TimeTracker::default();
        tracker.set_on_court(true, at(0));
        tracker.close_open(at(30));
        assert!(tracker.open_segment().is_none());
        assert_eq!(tracker.total_court(at(500)), Duration::from_secs(30));
    }

    #[test]
    fn received_timeline_keeps_a_single_open_segment() {
        let tracker = TimeTracker::from_segments(vec![
            TimeSegment {
                start_time: at(0),
                end_time: None,
                is_on_court: true,
            },
            TimeSegment {
                start_time: at(10),
                end_time: None,
                is_on_court: false,
            },
        ]);
        assert_eq!(open_count(&tracker), 1);
        assert_eq!(tracker.segments()[0].end_time, Some(at(10)));
    }

    #[test]
    fn segments_serialize_as_millis() {
        let segment = TimeSegment {
            start_time: from_millis(1_000),
            end_time: None,
            is_on_court: true,
        };
        let json = serde_json::to_string(&segment).unwrap();
        assert_eq!(json, r#"{"startTime":1000,"endTime":null,"isOnCourt":true}"#);
        let back: TimeSegment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, segment);
    }
}
