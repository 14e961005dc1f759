//! Snapshot persistence for projection state.
//!
//! A persisted snapshot is a [`SnapshotEnvelope`] (metadata) plus the
//! compressed safe-view bytes, stored either inline or offloaded to a blob
//! store when too large. This module provides:
//!
//! - [`SnapshotEnvelope`] - snapshot metadata, keyed by projector name and
//!   version
//! - [`StoredSnapshot`] - envelope plus optional inline bytes
//! - [`SnapshotStore`] - persistence trait, last-writer-wins per key
//! - [`BlobAccessor`] - raw byte storage for offloaded snapshots
//! - [`inmemory`] - reference implementations of both traits

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident::SortableUniqueId;

pub mod inmemory;

/// Metadata describing one persisted snapshot.
///
/// Snapshots are keyed by `(projector_name, projector_version)`: a snapshot
/// written by a different projector version is invisible to the current
/// build, which then rebuilds from the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub projector_name: String,
    pub projector_version: String,
    /// Registered name of the projected payload type, for inspection.
    pub payload_type_name: String,
    /// Position up to which the snapshot is complete; catch-up resumes
    /// strictly after it.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
    /// Events applied by the host when the snapshot was taken.
    pub events_processed: u64,
    /// When `true`, the bytes live in a blob store under `offload_key`
    /// instead of inline.
    pub is_offloaded: bool,
    pub offload_key: Option<String>,
    pub original_size_bytes: u64,
    pub compressed_size_bytes: u64,
    /// Safety threshold the safe view was cut at.
    pub safe_window_threshold: Option<SortableUniqueId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Software that wrote the snapshot.
    pub build_source: String,
    /// Machine that wrote the snapshot.
    pub build_host: String,
}

/// A snapshot as held by a [`SnapshotStore`].
#[derive(Clone, Debug)]
pub struct StoredSnapshot {
    pub envelope: SnapshotEnvelope,
    /// Compressed snapshot bytes; `None` when offloaded.
    pub inline: Option<Vec<u8>>,
}

/// Persistence for projection snapshots.
///
/// One slot per `(projector_name, projector_version)` pair; `put` replaces
/// any previous snapshot under the same key.
pub trait SnapshotStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the snapshot for a projector name and version.
    ///
    /// Returns `Ok(None)` when no snapshot exists under that key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn get<'a>(
        &'a self,
        projector_name: &'a str,
        projector_version: &'a str,
    ) -> impl Future<Output = Result<Option<StoredSnapshot>, Self::Error>> + Send + 'a;

    /// Store a snapshot, replacing any previous one under the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn put(
        &self,
        snapshot: StoredSnapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Remove the snapshot under a key, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn delete<'a>(
        &'a self,
        projector_name: &'a str,
        projector_version: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// List every stored envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn list_all(
        &self,
    ) -> impl Future<Output = Result<Vec<SnapshotEnvelope>, Self::Error>> + Send + '_;
}

/// Raw byte storage for offloaded snapshot payloads.
pub trait BlobAccessor: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read the bytes stored under `key`.
    ///
    /// Returns `Ok(None)` for unknown keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn read<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send + 'a;

    /// Write bytes under `key`, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn write<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
