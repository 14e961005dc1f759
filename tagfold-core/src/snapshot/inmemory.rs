//! In-memory snapshot and blob stores for testing.

use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use crate::snapshot::{BlobAccessor, SnapshotEnvelope, SnapshotStore, StoredSnapshot};

/// Thread-safe in-memory [`SnapshotStore`].
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct Store {
    snapshots: Arc<RwLock<HashMap<(String, String), StoredSnapshot>>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for Store {
    type Error = Infallible;

    fn get<'a>(
        &'a self,
        projector_name: &'a str,
        projector_version: &'a str,
    ) -> impl Future<Output = Result<Option<StoredSnapshot>, Self::Error>> + Send + 'a {
        let snapshot = self
            .snapshots
            .read()
            .expect("in-memory snapshot store lock poisoned")
            .get(&(projector_name.to_string(), projector_version.to_string()))
            .cloned();
        std::future::ready(Ok(snapshot))
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(
            projector = %snapshot.envelope.projector_name,
            version = %snapshot.envelope.projector_version,
        )
    )]
    fn put(
        &self,
        snapshot: StoredSnapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let key = (
            snapshot.envelope.projector_name.clone(),
            snapshot.envelope.projector_version.clone(),
        );
        self.snapshots
            .write()
            .expect("in-memory snapshot store lock poisoned")
            .insert(key, snapshot);
        std::future::ready(Ok(()))
    }

    fn delete<'a>(
        &'a self,
        projector_name: &'a str,
        projector_version: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.snapshots
            .write()
            .expect("in-memory snapshot store lock poisoned")
            .remove(&(projector_name.to_string(), projector_version.to_string()));
        std::future::ready(Ok(()))
    }

    fn list_all(
        &self,
    ) -> impl Future<Output = Result<Vec<SnapshotEnvelope>, Self::Error>> + Send + '_ {
        let envelopes = self
            .snapshots
            .read()
            .expect("in-memory snapshot store lock poisoned")
            .values()
            .map(|snapshot| snapshot.envelope.clone())
            .collect();
        std::future::ready(Ok(envelopes))
    }
}

/// Thread-safe in-memory [`BlobAccessor`].
#[derive(Clone, Default)]
pub struct BlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl BlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobAccessor for BlobStore {
    type Error = Infallible;

    fn read<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send + 'a {
        let bytes = self
            .blobs
            .read()
            .expect("in-memory blob store lock poisoned")
            .get(key)
            .cloned();
        std::future::ready(Ok(bytes))
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.blobs
            .write()
            .expect("in-memory blob store lock poisoned")
            .insert(key.to_string(), bytes);
        std::future::ready(Ok(()))
    }
}
