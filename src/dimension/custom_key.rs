use tracing::warn;

use crate::config::{DimensionConfig, DimensionKind};
use crate::interaction::event::{MessageEvent, TimelineEvent};
use crate::interaction::Interaction;

use super::key::KeyBuilder;

/// Everything a strategy may look at for one message event.
#[derive(Debug, Clone, Copy)]
pub struct EventScope<'a> {
    pub interaction: &'a Interaction,
    pub event: &'a TimelineEvent,
    pub message: &'a MessageEvent,
    /// Timeline events inside the event's window, in timestamp order.
    pub window_events: &'a [TimelineEvent],
}

/// Produces the dimension-specific part of a dimension key.
pub trait CustomKeyStrategy: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns `None` when no key can be formed; the event is then skipped.
    fn custom_key(&self, scope: &EventScope<'_>) -> Option<String>;
}

/// Groups by event kind, message language, and whether the visit that
/// followed was productive or browsed beyond the landing page.
#[derive(Debug, Clone)]
pub struct ByMessage {
    default_language: String,
}

impl ByMessage {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
        }
    }
}

impl CustomKeyStrategy for ByMessage {
    fn name(&self) -> &'static str {
        "by_message"
    }

    fn custom_key(&self, scope: &EventScope<'_>) -> Option<String> {
        let language = match scope.message.message_language.as_deref() {
            Some(lang) if !lang.trim().is_empty() => lang,
            _ => {
                warn!(
                    event_id = %scope.event.id,
                    interaction_id = %scope.interaction.id,
                    dimension = self.name(),
                    default = %self.default_language,
                    "message event has no language, using default"
                );
                self.default_language.as_str()
            }
        };

        let (is_productive, is_browsed) = if scope.interaction.web_visit.is_some() {
            // i128 keeps the sign exact whatever the i64 values are.
            let engagement: i128 = scope
                .window_events
                .iter()
                .map(|e| i128::from(e.engagement_value))
                .sum();
            let pages = scope
                .window_events
                .iter()
                .filter(|e| e.is_page_view())
                .count();
            (engagement > 0, pages > 1)
        } else {
            (false, false)
        };

        Some(
            KeyBuilder::with_capacity(16 + language.len())
                .add(scope.message.event_kind.ordinal())
                .add(language)
                .add(is_productive)
                .add(is_browsed)
                .build(),
        )
    }
}

/// Strategy selected by configuration.
#[derive(Debug, Clone)]
pub enum CustomKey {
    ByMessage(ByMessage),
}

impl CustomKey {
    pub fn from_config(cfg: &DimensionConfig) -> Self {
        match cfg.kind {
            DimensionKind::ByMessage => Self::ByMessage(ByMessage::new(&cfg.default_language)),
        }
    }
}

impl CustomKeyStrategy for CustomKey {
    fn name(&self) -> &'static str {
        match self {
            Self::ByMessage(s) => s.name(),
        }
    }

    fn custom_key(&self, scope: &EventScope<'_>) -> Option<String> {
        match self {
            Self::ByMessage(s) => s.custom_key(scope),
        }
    }
}
