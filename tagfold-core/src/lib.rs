//! Core traits and types for the tagfold projection engine.
//!
//! This crate provides the foundational abstractions for tag-based,
//! dynamic-consistency-boundary projections:
//!
//! - [`ident`] - Time-ordered unique identifiers (`SortableUniqueId`)
//! - [`tag`] - Tags, tag groups, and per-tag projected state
//! - [`event`] - Events and the payload/projector contracts
//! - [`registry`] - Payload codec and projector version registry
//! - [`state`] - The dual safe/unsafe fold engine (`SafeUnsafeProjectionState`)
//! - [`projector`] - The per-group projection adapter (`TagMultiProjector`)
//! - [`window`] - Lag-driven safety-window sizing (`SafeWindow`)
//! - [`store`] - Event feed abstraction (`EventStore`)
//! - [`snapshot`] - Snapshot and blob storage abstractions
//! - [`host`] - Projection hosting (`ProjectionHost`, `HostHandle`)
//!
//! Most users should depend on the `tagfold` crate, which re-exports these
//! types with a cleaner API surface.

pub mod event;
pub mod host;
pub mod ident;
pub mod projector;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod tag;
pub mod window;
