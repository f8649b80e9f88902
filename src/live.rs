//! Live-merge feed: one ordered view over a snapshot plus streamed inserts.
//!
//! A per-case record list is served as an initial snapshot fetch and a
//! subscription delivering rows inserted afterwards. `LiveFeed` merges the
//! two into a single sequence ordered by creation time, suppressing
//! duplicates by record id — the snapshot and the subscription can race for
//! the same row, and redelivery must not show it twice.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{AttachmentRecord, InternalNoteRecord, MessageRecord};

/// A record that can ride a live feed.
pub trait FeedItem {
    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
}

impl FeedItem for MessageRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl FeedItem for InternalNoteRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl FeedItem for AttachmentRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Ordered, id-deduplicated union of a snapshot and live inserts.
pub struct LiveFeed<T> {
    items: Vec<T>,
    seen: HashSet<Uuid>,
}

impl<T: FeedItem> Default for LiveFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FeedItem> LiveFeed<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Seed the feed with the initial fetch. Items already applied (a live
    /// insert that arrived before the snapshot returned) are skipped.
    pub fn apply_snapshot(&mut self, snapshot: impl IntoIterator<Item = T>) {
        for item in snapshot {
            self.apply(item);
        }
    }

    /// Merge one inserted row. Returns `false` when the id was already
    /// present (the row is dropped).
    pub fn apply(&mut self, item: T) -> bool {
        if !self.seen.insert(item.id()) {
            return false;
        }
        let key = (item.created_at(), item.id());
        let position = self
            .items
            .partition_point(|existing| (existing.created_at(), existing.id()) <= key);
        self.items.insert(position, item);
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.seen.contains(&id)
    }

    /// The merged view, creation time ascending.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
