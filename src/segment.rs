//! Time segmentation.
//!
//! Catch-up replay is checkpointed per [`TimeSegment`]; the planner tiles a
//! sync window into day-aligned half-open segments so that a crash never
//! loses more than one day of progress and the per-segment dedup key set
//! stays bounded.

use chrono::{DateTime, Days, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open time interval `[start, end)`.
///
/// Segments are value objects: two segments are equal iff both endpoints
/// match exactly, which is also the checkpoint lookup rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// An unsegmented sync window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Partition `range` into ordered day-aligned segments.
///
/// Interior boundaries fall on UTC midnights; the first segment begins at
/// `range.start` and the last ends at `range.end`, so the union of the
/// returned segments is exactly `[start, end)` with no gaps and no
/// overlaps. With `daily` disabled the whole range is one segment. The
/// result is empty iff `start >= end`.
pub fn plan_segments(range: TimeRange, daily: bool) -> Vec<TimeSegment> {
    if range.start >= range.end {
        return Vec::new();
    }

    if !daily {
        return vec![TimeSegment {
            start: range.start,
            end: range.end,
        }];
    }

    let mut segments = Vec::new();
    let mut current = range.start;

    while current < range.end {
        let next_midnight =
            NaiveDateTime::new(current.date_naive() + Days::new(1), NaiveTime::MIN).and_utc();
        let end = next_midnight.min(range.end);
        segments.push(TimeSegment {
            start: current,
            end,
        });
        current = end;
    }

    segments
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn empty_range_yields_no_segments() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(plan_segments(TimeRange { start: at, end: at }, true).is_empty());
        assert!(plan_segments(
            TimeRange {
                start: at,
                end: at - chrono::Duration::seconds(1)
            },
            true
        )
        .is_empty());
    }

    #[test]
    fn disabled_daily_returns_single_segment() {
        let range = TimeRange {
            start: ts("2024-01-01T06:00:00Z"),
            end: ts("2024-01-05T18:00:00Z"),
        };
        let segments = plan_segments(range, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, range.start);
        assert_eq!(segments[0].end, range.end);
    }

    #[test]
    fn segments_tile_the_range_exactly() {
        let range = TimeRange {
            start: ts("2024-01-01T06:30:00Z"),
            end: ts("2024-01-04T02:15:00Z"),
        };
        let segments = plan_segments(range, true);
        assert_eq!(segments.len(), 4);

        assert_eq!(segments[0].start, range.start);
        assert_eq!(segments.last().unwrap().end, range.end);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        // Interior boundaries are midnights.
        assert_eq!(segments[0].end, ts("2024-01-02T00:00:00Z"));
        assert_eq!(segments[2].end, ts("2024-01-04T00:00:00Z"));
    }

    #[test]
    fn bootstrap_window_splits_into_two_days() {
        // Ten rows spread over two calendar days produce two segments, the
        // second ending exactly at the window end.
        let range = TimeRange {
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-02T12:00:01Z"),
        };
        let segments = plan_segments(range, true);
        assert_eq!(
            segments,
            vec![
                TimeSegment {
                    start: ts("2024-01-01T00:00:00Z"),
                    end: ts("2024-01-02T00:00:00Z"),
                },
                TimeSegment {
                    start: ts("2024-01-02T00:00:00Z"),
                    end: ts("2024-01-02T12:00:01Z"),
                },
            ]
        );
    }

    #[test]
    fn midnight_aligned_start_does_not_produce_empty_segment() {
        let range = TimeRange {
            start: ts("2024-03-01T00:00:00Z"),
            end: ts("2024-03-02T00:00:00Z"),
        };
        let segments = plan_segments(range, true);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, range.start);
        assert_eq!(segments[0].end, range.end);
    }
}
