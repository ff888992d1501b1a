pub mod custom_key;
pub mod key;
pub mod metric;
pub mod window;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::contact::{ContactResolver, ContactSource};
use crate::export::health::HealthMetrics;
use crate::interaction::event::{MessageEvent, PageViewEvent, TimelineEvent};
use crate::interaction::{message_events, Interaction, VisitContext};
use crate::unique::{UniqueEventCache, UniqueEventKey};

use self::custom_key::{CustomKey, CustomKeyStrategy, EventScope};
use self::key::{HierarchicalKeyBuilder, KEY_DELIMITER};
use self::metric::AggregateRecord;

/// Failure aggregating one interaction. The interaction yields no records.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("engagement total overflowed in the window of event {event_id}")]
    EngagementOverflow { event_id: Uuid },

    #[error("{counter} count overflowed in the window of event {event_id}")]
    CounterOverflow {
        event_id: Uuid,
        counter: &'static str,
    },
}

/// Per-message-event segment aggregation over interaction timelines.
///
/// Every message event gets the window from its own timestamp up to the
/// next later message event; page views, goals and engagement in that
/// window are credited to it. Opens and clicks are additionally checked
/// against the contact store for being the contact's first occurrence.
pub struct Dimension<S> {
    id: Uuid,
    strategy: CustomKey,
    cache: Arc<UniqueEventCache>,
    resolver: ContactResolver<S>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: ContactSource> Dimension<S> {
    pub fn new(
        id: Uuid,
        strategy: CustomKey,
        cache: Arc<UniqueEventCache>,
        resolver: ContactResolver<S>,
    ) -> Self {
        Self {
            id,
            strategy,
            cache,
            resolver,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Records for one visit. Never fails: aggregation errors are logged and
    /// the visit contributes nothing.
    pub async fn get_data(&self, ctx: &VisitContext) -> Vec<AggregateRecord> {
        let Some(interaction) = ctx.interaction.as_ref() else {
            debug!(visit_id = %ctx.visit_id, "visit has no interaction");
            return Vec::new();
        };

        debug!(
            visit_id = %ctx.visit_id,
            interaction_id = %interaction.id,
            dimension = self.name(),
            "processing interaction"
        );

        let start = Instant::now();
        let records = match self.dimensions(interaction).await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    visit_id = %ctx.visit_id,
                    interaction_id = %interaction.id,
                    dimension = self.name(),
                    error = %e,
                    "aggregating interaction failed"
                );
                if let Some(ref m) = self.metrics {
                    m.visits_failed.inc();
                }
                Vec::new()
            }
        };

        if let Some(ref m) = self.metrics {
            m.visits_processed.inc();
            m.records_emitted.inc_by(records.len() as f64);
            m.interaction_processing_duration
                .observe(start.elapsed().as_secs_f64());
            m.unique_cache_entries.set(self.cache.len() as f64);
        }

        debug!(
            visit_id = %ctx.visit_id,
            interaction_id = %interaction.id,
            dimension = self.name(),
            records = records.len(),
            "interaction processed"
        );

        records
    }

    /// One record per message event of the interaction, in timeline order.
    ///
    /// Events whose dimension key cannot be formed are skipped.
    pub async fn dimensions(
        &self,
        interaction: &Interaction,
    ) -> Result<Vec<AggregateRecord>, AggregationError> {
        if !interaction.has_message_events() {
            debug!(interaction_id = %interaction.id, "no message events found");
            return Ok(Vec::new());
        }

        let events = interaction.ordered_events();
        let mut records = Vec::new();

        for (event, message) in message_events(&events) {
            let window = window::partition(&events, event);
            let scope = EventScope {
                interaction,
                event,
                message,
                window_events: window.slice(&events),
            };

            let Some(dimension_key) = self.dimension_key(&scope) else {
                continue;
            };

            let mut record = aggregate(&scope, &events, dimension_key)?;

            if message.event_kind.tracks_uniqueness()
                && self
                    .is_unique_event(interaction.contact_id, event, message)
                    .await
            {
                record.unique_count = 1;
            }

            records.push(record);
        }

        Ok(records)
    }

    /// Whether `event` is the contact's first occurrence of its
    /// message/instance/kind combination.
    ///
    /// Confirmed first occurrences are remembered; anything else is asked
    /// of the contact store again next time.
    pub async fn is_unique_event(
        &self,
        contact_id: Option<Uuid>,
        event: &TimelineEvent,
        message: &MessageEvent,
    ) -> bool {
        let Some(contact_id) = contact_id.filter(|id| !id.is_nil()) else {
            self.record_unique_check("no_contact");
            return false;
        };

        let key = UniqueEventKey {
            contact_id,
            message_id: message.message_id,
            instance_id: message.instance_id,
            kind: message.event_kind,
        };

        // A confirmed first occurrence never changes, so a cached id that
        // differs settles the question without asking the store.
        if let Some(confirmed) = self.cache.confirmed(&key) {
            let unique = confirmed == event.id;
            debug!(%contact_id, event_id = %event.id, unique, "unique event cache hit");
            self.record_unique_check(if unique { "cache_hit" } else { "cache_mismatch" });
            return unique;
        }

        debug!(%contact_id, event_id = %event.id, "unique event not cached, consulting contact store");

        let canonical = self
            .resolver
            .resolve(contact_id)
            .await
            .and_then(|contact| contact.key_behavior)
            .and_then(|facet| {
                facet.first_occurrence(message.message_id, message.instance_id, message.event_kind)
            });

        let Some(canonical) = canonical else {
            self.record_unique_check("unresolved");
            return false;
        };

        if canonical != event.id {
            self.record_unique_check("rejected");
            return false;
        }

        let held = self.cache.confirm(key, event.id);
        self.record_unique_check("confirmed");
        held == event.id
    }

    fn dimension_key(&self, scope: &EventScope<'_>) -> Option<String> {
        let base = self.base_key(scope.message)?;
        let Some(custom) = self.strategy.custom_key(scope) else {
            self.record_skip("no_custom_key");
            return None;
        };

        let mut key = String::with_capacity(base.len() + 1 + custom.len());
        key.push_str(&base);
        key.push(KEY_DELIMITER);
        key.push_str(&custom);
        Some(key)
    }

    fn base_key(&self, message: &MessageEvent) -> Option<String> {
        if message.manager_root_id.is_nil() {
            debug!(
                parameter = "manager_root_id",
                event_kind = %message.event_kind,
                dimension = self.name(),
                "parameter is missing, message event will not be processed"
            );
            self.record_skip("missing_manager_root_id");
            return None;
        }

        if message.message_id.is_nil() {
            debug!(
                parameter = "message_id",
                event_kind = %message.event_kind,
                dimension = self.name(),
                "parameter is missing, message event will not be processed"
            );
            self.record_skip("missing_message_id");
            return None;
        }

        Some(
            HierarchicalKeyBuilder::new()
                .add(message.manager_root_id)
                .add(message.message_id)
                .build(),
        )
    }

    fn record_skip(&self, reason: &str) {
        if let Some(ref m) = self.metrics {
            m.events_skipped.with_label_values(&[reason]).inc();
        }
    }

    fn record_unique_check(&self, result: &str) {
        if let Some(ref m) = self.metrics {
            m.unique_checks.with_label_values(&[result]).inc();
        }
    }
}

/// Computes the window metrics of one message event.
/// `timeline` is the whole ordered interaction, used to find the parent.
fn aggregate(
    scope: &EventScope<'_>,
    timeline: &[TimelineEvent],
    dimension_key: String,
) -> Result<AggregateRecord, AggregationError> {
    let event_id = scope.event.id;
    let parent_id = scope.event.parent_event_id;

    let browsed = scope
        .window_events
        .iter()
        .filter(|e| e.is_page_view() && Some(e.id) != parent_id)
        .count();
    let goals = scope.window_events.iter().filter(|e| e.is_goal()).count();

    let engagement_total = scope
        .window_events
        .iter()
        .try_fold(0i64, |acc, e| acc.checked_add(e.engagement_value))
        .ok_or(AggregationError::EngagementOverflow { event_id })?;

    let time_on_site_seconds = parent_id
        .and_then(|id| single_page_view(timeline, id))
        .map_or(0, |parent| parent.duration.as_secs());

    let overflow = |counter| AggregationError::CounterOverflow { event_id, counter };
    let browsed = u32::try_from(browsed).map_err(|_| overflow("page_views"))?;

    Ok(AggregateRecord {
        page_views: browsed.checked_add(1).ok_or_else(|| overflow("page_views"))?,
        bounces: u32::from(browsed == 0),
        conversions: u32::try_from(goals).map_err(|_| overflow("conversions"))?,
        engagement_total,
        time_on_site_seconds,
        ..AggregateRecord::new(dimension_key)
    })
}

/// The page view with the given id, if exactly one exists.
fn single_page_view(timeline: &[TimelineEvent], id: Uuid) -> Option<&PageViewEvent> {
    let mut matches = timeline
        .iter()
        .filter(|e| e.id == id)
        .filter_map(TimelineEvent::as_page_view);

    let first = matches.next()?;
    match matches.next() {
        Some(_) => None,
        None => Some(first),
    }
}
