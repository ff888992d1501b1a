pub mod event;
pub mod parse;

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use self::event::{MessageEvent, TimelineEvent};

/// Web session context attached to an interaction that happened on a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebVisit {
    pub site_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// One contact's timeline of events for a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    /// Absent for anonymous visitors; disables uniqueness checks.
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    #[serde(default)]
    pub web_visit: Option<WebVisit>,
    /// Expected in ascending timestamp order.
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

impl Interaction {
    /// Whether the timeline is in ascending timestamp order.
    pub fn is_ordered(&self) -> bool {
        self.events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    }

    /// Returns the timeline in ascending timestamp order, borrowing when the
    /// producer already sorted it. The sort is stable so events sharing a
    /// timestamp keep their relative order.
    pub fn ordered_events(&self) -> Cow<'_, [TimelineEvent]> {
        if self.is_ordered() {
            return Cow::Borrowed(&self.events);
        }

        let mut events = self.events.clone();
        events.sort_by_key(|e| e.timestamp);
        Cow::Owned(events)
    }

    pub fn has_message_events(&self) -> bool {
        message_events(&self.events).next().is_some()
    }
}

/// Iterates the message events of a timeline, keeping its order.
pub fn message_events(
    events: &[TimelineEvent],
) -> impl Iterator<Item = (&TimelineEvent, &MessageEvent)> {
    events
        .iter()
        .filter_map(|e| e.as_message().map(|m| (e, m)))
}

/// What the host pipeline hands a dimension for one visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitContext {
    pub visit_id: Uuid,
    /// Absent when the host had no interaction payload for the visit.
    #[serde(default)]
    pub interaction: Option<Interaction>,
}

#[cfg(test)]
mod tests {
    use super::event::{MessageEventKind, PageViewEvent, TypedEvent};
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn page_view(n: u128, secs: i64) -> TimelineEvent {
        TimelineEvent {
            id: Uuid::from_u128(n),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            engagement_value: 0,
            parent_event_id: None,
            typed: TypedEvent::PageView(PageViewEvent {
                duration: Duration::from_secs(1),
                url: None,
            }),
        }
    }

    fn open(n: u128, secs: i64) -> TimelineEvent {
        TimelineEvent {
            id: Uuid::from_u128(n),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            engagement_value: 0,
            parent_event_id: None,
            typed: TypedEvent::Message(MessageEvent {
                message_id: Uuid::from_u128(100),
                instance_id: Uuid::from_u128(101),
                manager_root_id: Uuid::from_u128(102),
                event_kind: MessageEventKind::Open,
                message_language: None,
            }),
        }
    }

    fn interaction(events: Vec<TimelineEvent>) -> Interaction {
        Interaction {
            id: Uuid::from_u128(1),
            contact_id: None,
            web_visit: None,
            events,
        }
    }

    #[test]
    fn test_ordered_events_borrows_sorted_timeline() {
        let i = interaction(vec![page_view(1, 0), open(2, 0), page_view(3, 5)]);
        assert!(i.is_ordered());
        assert!(matches!(i.ordered_events(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_ordered_events_sorts_stably() {
        let i = interaction(vec![page_view(1, 10), open(2, 5), page_view(3, 5)]);
        assert!(!i.is_ordered());

        let events = i.ordered_events();
        let ids: Vec<u128> = events.iter().map(|e| e.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_message_events_filters_variants() {
        let i = interaction(vec![page_view(1, 0), open(2, 1), page_view(3, 2), open(4, 3)]);
        let ids: Vec<u128> = message_events(&i.events).map(|(e, _)| e.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(i.has_message_events());
        assert!(!interaction(vec![page_view(1, 0)]).has_message_events());
    }
}
