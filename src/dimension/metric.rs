use serde::{Deserialize, Serialize};

/// Segment metrics attributed to a single message event.
///
/// One record is produced per message event. Records sharing a
/// `dimension_key` are merged by whoever stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// `{manager_root}/{message}_{custom key}`.
    pub dimension_key: String,
    /// Always 1.
    pub visits: u32,
    /// The landing page plus every other page viewed in the window.
    pub page_views: u32,
    /// 1 when nothing was browsed after landing, else 0.
    pub bounces: u32,
    /// Goals triggered in the window.
    pub conversions: u32,
    /// Sum of engagement values in the window. May be negative.
    pub engagement_total: i64,
    /// Whole seconds spent on the landing page.
    pub time_on_site_seconds: u64,
    /// 1 when the event is the contact's first open/click of the message.
    pub unique_count: u32,
}

impl AggregateRecord {
    /// A record for a single visit that bounced off its landing page.
    pub fn new(dimension_key: String) -> Self {
        Self {
            dimension_key,
            visits: 1,
            page_views: 1,
            bounces: 1,
            conversions: 0,
            engagement_total: 0,
            time_on_site_seconds: 0,
            unique_count: 0,
        }
    }
}
