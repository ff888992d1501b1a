use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// MessageEventKind identifies what happened to an email message.
/// Discriminants are part of the dimension key and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageEventKind {
    Open = 0,
    Click = 1,
    Bounce = 2,
    Spam = 3,
    DispatchFailed = 4,
}

impl MessageEventKind {
    /// Returns the canonical wire/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Click => "click",
            Self::Bounce => "bounce",
            Self::Spam => "spam",
            Self::DispatchFailed => "dispatch_failed",
        }
    }

    /// Returns the ordinal used when building keys.
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether a first occurrence of this kind counts as a unique interaction.
    /// Only opens and clicks are deduplicated against the contact facet.
    pub const fn tracks_uniqueness(self) -> bool {
        matches!(self, Self::Open | Self::Click)
    }
}

impl fmt::Display for MessageEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an interaction timeline.
///
/// The common attributes live here; the variant-specific payload is in
/// [`TypedEvent`], flattened next to them on the wire under a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Unique within the owning interaction.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Signed engagement points credited to this event.
    #[serde(default)]
    pub engagement_value: i64,
    /// For message events: the page view that spawned them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<Uuid>,
    #[serde(flatten)]
    pub typed: TypedEvent,
}

impl TimelineEvent {
    /// Returns the message payload if this is a message event.
    pub fn as_message(&self) -> Option<&MessageEvent> {
        match &self.typed {
            TypedEvent::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the page view payload if this is a page view.
    pub fn as_page_view(&self) -> Option<&PageViewEvent> {
        match &self.typed {
            TypedEvent::PageView(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.typed, TypedEvent::Message(_))
    }

    pub fn is_page_view(&self) -> bool {
        matches!(self.typed, TypedEvent::PageView(_))
    }

    pub fn is_goal(&self) -> bool {
        matches!(self.typed, TypedEvent::Goal(_))
    }
}

/// Variant-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedEvent {
    Message(MessageEvent),
    PageView(PageViewEvent),
    Goal(GoalEvent),
    /// Timeline events this crate does not interpret. They still carry
    /// engagement value into any window they fall in.
    #[serde(other)]
    Other,
}

/// An open, click, bounce, spam complaint or dispatch failure of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Nil when the producer did not know the message.
    #[serde(default)]
    pub message_id: Uuid,
    #[serde(default)]
    pub instance_id: Uuid,
    /// Nil when the producer did not know the manager root.
    #[serde(default)]
    pub manager_root_id: Uuid,
    pub event_kind: MessageEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_language: Option<String>,
}

/// A page request within the visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageViewEvent {
    /// Time spent on the page.
    #[serde(default, with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A conversion goal that was triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
