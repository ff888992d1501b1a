use chrono::{DateTime, Utc};

use crate::interaction::event::TimelineEvent;

/// Half-open time window `[start, end)` attributed to one message event.
/// An `end` of `None` means the window runs to the end of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.end.map_or(true, |end| ts < end)
    }

    /// Returns the events of an ascending-sorted timeline that fall in the window.
    pub fn slice<'a>(&self, events: &'a [TimelineEvent]) -> &'a [TimelineEvent] {
        let lo = events.partition_point(|e| e.timestamp < self.start);
        let hi = match self.end {
            Some(end) => events.partition_point(|e| e.timestamp < end),
            None => events.len(),
        };
        events.get(lo..hi.max(lo)).unwrap_or_default()
    }
}

/// Computes the window scoped to `anchor`.
///
/// The window opens at the anchor and closes at the first message event
/// strictly later than it. Message events sharing the anchor's timestamp do
/// not close it, so simultaneous message events get the same window.
/// `events` must be sorted ascending by timestamp.
pub fn partition(events: &[TimelineEvent], anchor: &TimelineEvent) -> TimeWindow {
    let end = events
        .iter()
        .filter(|e| e.is_message())
        .map(|e| e.timestamp)
        .find(|ts| *ts > anchor.timestamp);

    TimeWindow {
        start: anchor.timestamp,
        end,
    }
}
