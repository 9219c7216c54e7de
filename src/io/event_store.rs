//! Presence event store contract
//!
//! The tracker appends one record per state-relevant change; the query
//! surface reads them back newest first. Implementations must be safe to
//! call from the polling task and HTTP handlers concurrently and must hand
//! out strictly increasing ids in append order.

use crate::domain::types::{NewPresenceEvent, PresenceEvent};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by event store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed
    #[error("event log I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Encoding an event as JSON failed
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Backend refused the operation
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only presence event log
pub trait EventStore: Send + Sync {
    /// Persist an event and return it with its assigned id
    fn append(&self, event: NewPresenceEvent) -> Result<PresenceEvent, StoreError>;

    /// Up to `limit` most recent events, newest first
    fn fetch_recent(&self, limit: usize) -> Result<Vec<PresenceEvent>, StoreError>;

    /// Most recent event, `None` when nothing has been recorded
    fn latest(&self) -> Result<Option<PresenceEvent>, StoreError>;
}

/// Newest-first window over an id-ordered slice
pub(crate) fn newest_first(events: &[PresenceEvent], limit: usize) -> Vec<PresenceEvent> {
    events.iter().rev().take(limit).cloned().collect()
}

/// Volatile store, used when no log path is configured and in tests
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<PresenceEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// All events in append order
    pub fn all(&self) -> Vec<PresenceEvent> {
        self.events.lock().clone()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, event: NewPresenceEvent) -> Result<PresenceEvent, StoreError> {
        let mut events = self.events.lock();
        let id = events.last().map_or(1, |e| e.id + 1);
        let stored = PresenceEvent::from_new(id, event);
        events.push(stored.clone());
        Ok(stored)
    }

    fn fetch_recent(&self, limit: usize) -> Result<Vec<PresenceEvent>, StoreError> {
        Ok(newest_first(&self.events.lock(), limit))
    }

    fn latest(&self) -> Result<Option<PresenceEvent>, StoreError> {
        Ok(self.events.lock().last().cloned())
    }
}
