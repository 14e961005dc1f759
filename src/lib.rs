#![doc = include_str!("../README.md")]

pub use tagfold_core::{
    event,
    event::{Event, EventPayload, PayloadType, TagProjector, TagStatePayload},
    host,
    host::{
        DeliveryStatistics, HostError, HostHandle, HostOptions, HostStatus, PersistOutcome,
        ProjectionHost,
    },
    ident,
    ident::SortableUniqueId,
    projector,
    projector::{ProjectionView, SerializedProjection, SnapshotCodecError, TagMultiProjector},
    registry,
    registry::{DomainTypeRegistry, RegistryError},
    state,
    state::SafeUnsafeProjectionState,
    tag,
    tag::{Tag, TagGroup, TagState, TagStateId},
    window,
    window::{SafeWindow, SafeWindowConfig},
};

pub mod store {
    pub use tagfold_core::store::{EventStore, NonEmpty};

    pub use tagfold_core::store::inmemory;
}

pub mod snapshot {
    pub use tagfold_core::snapshot::{
        BlobAccessor, SnapshotEnvelope, SnapshotStore, StoredSnapshot,
    };

    pub use tagfold_core::snapshot::inmemory;
}
