//! In-memory event store implementation for testing.
//!
//! [`Store`] keeps the full log in a sorted `Vec` behind an `RwLock` and
//! broadcasts appended events to live subscribers, which is enough to drive
//! a projection host end to end in tests and examples.

use std::{
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;
use tokio::sync::broadcast;

use crate::{
    event::Event,
    ident::SortableUniqueId,
    store::EventStore,
};

const FEED_CAPACITY: usize = 1024;

/// Thread-safe in-memory event log.
///
/// Events are kept ordered by their sortable id regardless of append order,
/// so reads always return the log in position order. Cloning the store
/// clones a handle to the same log.
#[derive(Clone)]
pub struct Store {
    events: Arc<RwLock<Vec<Event>>>,
    feed: broadcast::Sender<Event>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            feed,
        }
    }

    /// Append a batch of events, keeping the log sorted by position.
    ///
    /// Appended events are also broadcast to live subscribers in batch
    /// order; subscribers that lag too far behind miss events, as with any
    /// broadcast channel.
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    pub fn append(&self, events: NonEmpty<Event>) {
        {
            let mut log = self.events.write().expect("in-memory store lock poisoned");
            for event in &events {
                let at = log
                    .partition_point(|e| e.sortable_unique_id <= event.sortable_unique_id);
                log.insert(at, event.clone());
            }
        }
        for event in events {
            // No receivers is fine; nothing is listening yet.
            let _ = self.feed.send(event);
        }
    }

    /// Subscribe to events appended after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for Store {
    type Error = Infallible;

    fn read_events_after<'a>(
        &'a self,
        after: Option<&'a SortableUniqueId>,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a {
        let events = {
            let log = self.events.read().expect("in-memory store lock poisoned");
            match after {
                None => log.clone(),
                Some(after) => {
                    let from = log.partition_point(|e| e.sortable_unique_id <= *after);
                    log[from..].to_vec()
                }
            }
        };
        tracing::trace!(count = events.len(), "read events from in-memory log");
        std::future::ready(Ok(events))
    }

    fn event_count(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_ {
        let count = self
            .events
            .read()
            .expect("in-memory store lock poisoned")
            .len();
        std::future::ready(Ok(count))
    }
}
