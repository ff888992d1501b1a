use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::interaction::event::MessageEventKind;

/// Identity of a first-occurrence check: one contact's events of one kind
/// for one message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueEventKey {
    pub contact_id: Uuid,
    pub message_id: Uuid,
    pub instance_id: Uuid,
    pub kind: MessageEventKind,
}

#[derive(Debug, Clone, Copy)]
struct ConfirmedEvent {
    event_id: Uuid,
    confirmed_at: Instant,
}

/// Process-local memo of first occurrences already confirmed by the contact
/// store.
///
/// Only confirmations are stored; a key without an entry must be re-checked
/// remotely. Shared between concurrently processed interactions through
/// `DashMap`, so writers to different keys never contend on one lock.
pub struct UniqueEventCache {
    entries: DashMap<UniqueEventKey, ConfirmedEvent>,
    /// Entries older than this are treated as absent. `None` keeps them for
    /// the lifetime of the process.
    ttl: Option<Duration>,
}

impl UniqueEventCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::with_capacity(1024),
            ttl,
        }
    }

    /// Returns the event id confirmed as the first occurrence for `key`.
    pub fn confirmed(&self, key: &UniqueEventKey) -> Option<Uuid> {
        let entry = self.entries.get(key)?;
        if !self.is_expired(&entry) {
            return Some(entry.event_id);
        }

        // Release the shard read lock before taking the write lock.
        drop(entry);
        self.entries.remove_if(key, |_, v| self.is_expired(v));
        None
    }

    /// Records `event_id` as the confirmed first occurrence for `key`.
    ///
    /// The first confirmation wins; a concurrent writer confirming the same
    /// key leaves the existing entry in place. Returns the id held by the
    /// cache after the call.
    pub fn confirm(&self, key: UniqueEventKey, event_id: Uuid) -> Uuid {
        let now = Instant::now();
        let mut entry = self.entries.entry(key).or_insert(ConfirmedEvent {
            event_id,
            confirmed_at: now,
        });

        if self.is_expired(&entry) {
            *entry = ConfirmedEvent {
                event_id,
                confirmed_at: now,
            };
        }

        entry.event_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &ConfirmedEvent) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.confirmed_at.elapsed() >= ttl)
    }
}

impl Default for UniqueEventCache {
    fn default() -> Self {
        Self::new(None)
    }
}
