//! Event feed abstractions.
//!
//! Projection hosts consume the log through the [`EventStore`] trait: an
//! ordered read of events after a position marker, used for catch-up after a
//! snapshot restore and for refresh. A reference in-memory implementation
//! lives in [`inmemory`].

use std::future::Future;

pub use nonempty::NonEmpty;

use crate::{event::Event, ident::SortableUniqueId};

pub mod inmemory;

/// Read access to the ordered event log.
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load events strictly after `after`, in ascending position order.
    ///
    /// `None` reads the log from its beginning.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the read fails.
    fn read_events_after<'a>(
        &'a self,
        after: Option<&'a SortableUniqueId>,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a;

    /// Total number of events in the log.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the read fails.
    fn event_count(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}
