//! Filtered delivery of committed writes to watchers.
//!
//! Each watcher owns a bounded channel and only receives the events its
//! filter selects, so traffic it ignores never fills its buffer.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::{StoreEvent, StoreEventKind, StoreEventType, EVENT_CHANNEL_CAPACITY};

/// Selects the events a watcher receives. An empty list selects every value
/// on that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    pub kinds: Vec<StoreEventKind>,
    pub events: Vec<StoreEventType>,
}

impl WatchFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(kinds: &[StoreEventKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: &[StoreEventType]) -> Self {
        self.events = events.to_vec();
        self
    }

    pub fn matches(&self, event: &StoreEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.events.is_empty() || self.events.contains(&event.event))
    }
}

struct Subscriber {
    filter: WatchFilter,
    tx: mpsc::Sender<StoreEvent>,
}

/// Registry of live watchers shared by the backends.
#[derive(Default)]
pub(crate) struct Watchers {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Watchers {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self, filter: WatchFilter) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.lock().push(Subscriber { filter, tx });
        rx
    }

    /// Hands `event` to every matching watcher without waiting. A full
    /// watcher misses the event; a dropped one is removed.
    pub(crate) fn publish(&self, event: &StoreEvent) {
        self.lock().retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        job_id = %event.job_id,
                        version = event.version,
                        "Watcher buffer full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}
