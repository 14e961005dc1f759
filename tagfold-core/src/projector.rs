//! Multi-tag projection over one tag group.
//!
//! [`TagMultiProjector`] binds the dual-view engine to a concrete
//! (projector, tag group) pair at compile time: `P` supplies the fold step
//! and `G` supplies key extraction. It also owns the snapshot wire format -
//! a flat, gzip-compressed JSON document of the safe view.

use std::{
    collections::HashMap,
    io::{Read, Write},
    marker::PhantomData,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::{Event, TagProjector},
    ident::SortableUniqueId,
    registry::DomainTypeRegistry,
    state::SafeUnsafeProjectionState,
    tag::{TagGroup, TagState, TagStateId},
};

const WIRE_VERSION: u32 = 1;

/// Errors from encoding or decoding projection snapshots.
#[derive(Debug, Error)]
pub enum SnapshotCodecError {
    /// A safe snapshot cannot be produced without a safety threshold.
    #[error("cannot serialize a snapshot without a safety threshold")]
    MissingThreshold,
    /// The document declares a wire version this build does not understand.
    #[error("unsupported snapshot wire version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot compression error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of serializing the safe view.
#[derive(Clone, Debug)]
pub struct SerializedProjection {
    /// Gzip-compressed snapshot document.
    pub compressed: Vec<u8>,
    /// Size of the JSON document before compression.
    pub original_size: usize,
    /// Number of entries captured.
    pub item_count: usize,
    /// Highest position among captured entries, if any.
    pub safe_last: Option<SortableUniqueId>,
}

/// A read-only view over the projection map.
#[derive(Clone, Debug)]
pub struct ProjectionView<K> {
    pub items: HashMap<K, TagState>,
    /// Sum of per-item versions.
    pub version: u64,
    /// Highest position among the view's entries.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotDoc {
    v: u32,
    items: Vec<SnapshotItem>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotItem {
    id: String,
    #[serde(rename = "type")]
    type_name: String,
    payload: serde_json::Value,
    version: u64,
    last: String,
}

/// Projection of all tags in group `G` through projector `P`.
///
/// Each event folds into the keys derived from its group-`G` tags; events
/// with no such tags leave the map untouched but still advance the
/// bookkeeping markers. A fold step producing a tombstone payload drops the
/// entry instead of storing it.
pub struct TagMultiProjector<P, G>
where
    P: TagProjector,
    G: TagGroup,
{
    state: SafeUnsafeProjectionState<G::Key, TagState>,
    last_event_id: Option<Uuid>,
    last_sortable_unique_id: Option<SortableUniqueId>,
    version: u64,
    _bind: PhantomData<fn() -> (P, G)>,
}

impl<P: TagProjector, G: TagGroup> Default for TagMultiProjector<P, G> {
    fn default() -> Self {
        Self {
            state: SafeUnsafeProjectionState::default(),
            last_event_id: None,
            last_sortable_unique_id: None,
            version: 0,
            _bind: PhantomData,
        }
    }
}

impl<P: TagProjector, G: TagGroup> Clone for TagMultiProjector<P, G> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            last_event_id: self.last_event_id,
            last_sortable_unique_id: self.last_sortable_unique_id.clone(),
            version: self.version,
            _bind: PhantomData,
        }
    }
}

impl<P: TagProjector, G: TagGroup> std::fmt::Debug for TagMultiProjector<P, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagMultiProjector")
            .field("projector", &P::NAME)
            .field("group", &G::NAME)
            .field("items", &self.state.get_current_state().len())
            .field("version", &self.version)
            .finish()
    }
}

impl<P: TagProjector, G: TagGroup> TagMultiProjector<P, G> {
    #[must_use]
    pub fn initial() -> Self {
        Self::default()
    }

    /// Fold one event into the projection.
    ///
    /// Bookkeeping (`last_event_id`, `last_sortable_unique_id`, `version`)
    /// advances on every call, including events with no matching tags.
    #[must_use]
    pub fn apply(&self, event: &Event, threshold: Option<&SortableUniqueId>) -> Self {
        Self {
            state: self
                .state
                .process_event(event, Self::affected_keys, Self::fold_item, threshold),
            last_event_id: Some(event.id),
            last_sortable_unique_id: Some(event.sortable_unique_id.clone()),
            version: self.version + 1,
            _bind: PhantomData,
        }
    }

    /// Fold a batch of events in order.
    #[must_use]
    pub fn apply_all<'a, I>(&self, events: I, threshold: Option<&SortableUniqueId>) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut next = self.clone();
        for event in events {
            next = next.apply(event, threshold);
        }
        next
    }

    /// Advance the safety threshold without folding an event.
    ///
    /// Buffered events at or below `threshold` are promoted into settled
    /// state; the bookkeeping markers are unchanged.
    #[must_use]
    pub fn settle(&self, threshold: &SortableUniqueId) -> Self {
        Self {
            state: self
                .state
                .settle(threshold, Self::affected_keys, Self::fold_item),
            last_event_id: self.last_event_id,
            last_sortable_unique_id: self.last_sortable_unique_id.clone(),
            version: self.version,
            _bind: PhantomData,
        }
    }

    /// The full, possibly-tentative map.
    #[must_use]
    pub fn current_items(&self) -> &HashMap<G::Key, TagState> {
        self.state.get_current_state()
    }

    /// Deterministic map as of `threshold`.
    #[must_use]
    pub fn safe_items(&self, threshold: &SortableUniqueId) -> HashMap<G::Key, TagState> {
        self.state
            .get_safe_state(threshold, Self::affected_keys, Self::fold_item)
    }

    #[must_use]
    pub fn unsafe_projection(&self) -> ProjectionView<G::Key> {
        Self::view_of(self.current_items().clone())
    }

    #[must_use]
    pub fn safe_projection(&self, threshold: &SortableUniqueId) -> ProjectionView<G::Key> {
        Self::view_of(self.safe_items(threshold))
    }

    /// Number of events applied.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn last_event_id(&self) -> Option<Uuid> {
        self.last_event_id
    }

    #[must_use]
    pub fn last_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.last_sortable_unique_id.as_ref()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.state.get_current_state().len()
    }

    #[must_use]
    pub fn unsafe_item_count(&self) -> usize {
        self.state.unsafe_keys().count()
    }

    /// Whether an id at `marker` has been delivered.
    ///
    /// The feed is consumed in order, so a marker has been received exactly
    /// when the last applied position has reached it.
    #[must_use]
    pub fn is_id_received(&self, marker: &SortableUniqueId) -> bool {
        self.last_sortable_unique_id
            .as_ref()
            .is_some_and(|last| last >= marker)
    }

    /// Serialize the safe view at `threshold` into the compressed wire form.
    ///
    /// Entries are ordered by tag content so identical state always encodes
    /// to identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotCodecError::MissingThreshold`] when no threshold is
    /// available, or an encoding error.
    pub fn serialize(
        &self,
        threshold: Option<&SortableUniqueId>,
    ) -> Result<SerializedProjection, SnapshotCodecError> {
        let threshold = threshold.ok_or(SnapshotCodecError::MissingThreshold)?;
        let items = self.safe_items(threshold);
        let safe_last = items
            .values()
            .map(|state| state.last_sorted_unique_id.clone())
            .max();

        let mut entries = Vec::with_capacity(items.len());
        for (key, state) in &items {
            entries.push(SnapshotItem {
                id: G::content_of(key),
                type_name: state.payload.type_name().to_string(),
                payload: state.payload.payload_json()?,
                version: state.version,
                last: state.last_sorted_unique_id.to_string(),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let doc = serde_json::to_vec(&SnapshotDoc {
            v: WIRE_VERSION,
            items: entries,
        })?;
        let original_size = doc.len();
        let item_count = items.len();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&doc)?;
        let compressed = encoder.finish()?;

        Ok(SerializedProjection {
            compressed,
            original_size,
            item_count,
            safe_last,
        })
    }

    /// Rebuild a projection from the compressed wire form.
    ///
    /// Entries that no longer resolve (unregistered type name, payload shape
    /// mismatch, malformed key content) are skipped with a warning rather
    /// than failing the restore; the affected tags rebuild from the log on
    /// catch-up. All restored entries are treated as settled history.
    ///
    /// # Errors
    ///
    /// Returns a decoding error when the document itself is unreadable.
    pub fn deserialize(
        registry: &DomainTypeRegistry,
        bytes: &[u8],
    ) -> Result<Self, SnapshotCodecError> {
        let mut doc = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut doc)?;
        let doc: SnapshotDoc = serde_json::from_slice(&doc)?;
        if doc.v != WIRE_VERSION {
            return Err(SnapshotCodecError::UnsupportedVersion(doc.v));
        }

        let mut items = HashMap::with_capacity(doc.items.len());
        let mut last_sortable_unique_id: Option<SortableUniqueId> = None;
        for entry in doc.items {
            let Some(key) = G::key_of(&entry.id) else {
                tracing::warn!(group = G::NAME, id = %entry.id, "skipping snapshot entry with malformed key");
                continue;
            };
            let payload = match registry.decode_payload(&entry.type_name, &entry.payload) {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(id = %entry.id, %error, "skipping unresolvable snapshot entry");
                    continue;
                }
            };
            let last = SortableUniqueId::from(entry.last);
            if last_sortable_unique_id.as_ref().is_none_or(|max| last > *max) {
                last_sortable_unique_id = Some(last.clone());
            }
            let state = TagState {
                id: TagStateId::new(G::tag_of(&key), P::NAME),
                payload,
                version: entry.version,
                last_sorted_unique_id: last,
                projector_version: P::VERSION.to_string(),
            };
            items.insert(key, state);
        }

        Ok(Self {
            state: SafeUnsafeProjectionState::from_current_data(items),
            last_event_id: None,
            last_sortable_unique_id,
            version: 0,
            _bind: PhantomData,
        })
    }

    /// Render the projection as plain JSON for inspection.
    ///
    /// With a threshold the safe view is rendered; without one, the full
    /// current view.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a payload cannot be serialized.
    pub fn to_json(
        &self,
        threshold: Option<&SortableUniqueId>,
    ) -> Result<serde_json::Value, SnapshotCodecError> {
        let items = match threshold {
            Some(threshold) => self.safe_items(threshold),
            None => self.current_items().clone(),
        };
        let mut entries = Vec::with_capacity(items.len());
        for (key, state) in &items {
            entries.push(serde_json::json!({
                "id": G::content_of(key),
                "type": state.payload.type_name(),
                "payload": state.payload.payload_json()?,
                "version": state.version,
                "last": state.last_sorted_unique_id.to_string(),
            }));
        }
        entries.sort_by_key(|entry| entry["id"].as_str().map(str::to_string));
        Ok(serde_json::json!({
            "projector": P::NAME,
            "projectorVersion": P::VERSION,
            "group": G::NAME,
            "items": entries,
        }))
    }

    fn view_of(items: HashMap<G::Key, TagState>) -> ProjectionView<G::Key> {
        let version = items.values().map(|state| state.version).sum();
        let last_sortable_unique_id = items
            .values()
            .map(|state| state.last_sorted_unique_id.clone())
            .max();
        ProjectionView {
            items,
            version,
            last_sortable_unique_id,
        }
    }

    fn affected_keys(event: &Event) -> Vec<G::Key> {
        event
            .parsed_tags()
            .filter(|tag| tag.group == G::NAME)
            .filter_map(|tag| G::key_of(&tag.content))
            .collect()
    }

    fn fold_item(key: &G::Key, current: Option<TagState>, event: &Event) -> Option<TagState> {
        let previous_version = current.as_ref().map_or(0, |state| state.version);
        let payload = P::project(current.map(|state| state.payload), event);
        if payload.is_tombstone() {
            return None;
        }
        Some(TagState {
            id: TagStateId::new(G::tag_of(key), P::NAME),
            payload,
            version: previous_version + 1,
            last_sorted_unique_id: event.sortable_unique_id.clone(),
            projector_version: P::VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::{EventPayload, PayloadType, TagStatePayload};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct CountAdded {
        amount: u64,
    }

    impl EventPayload for CountAdded {
        const TYPE_NAME: &'static str = "CountAdded";
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct CountClosed;

    impl EventPayload for CountClosed {
        const TYPE_NAME: &'static str = "CountClosed";
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Counter {
        total: u64,
        closed: bool,
    }

    impl PayloadType for Counter {
        const TYPE_NAME: &'static str = "Counter";

        fn is_tombstone(&self) -> bool {
            self.closed
        }
    }

    struct DeviceGroup;

    impl TagGroup for DeviceGroup {
        const NAME: &'static str = "Device";
        type Key = u32;

        fn key_of(content: &str) -> Option<u32> {
            content.parse().ok()
        }

        fn content_of(key: &u32) -> String {
            key.to_string()
        }
    }

    struct CounterProjector;

    impl TagProjector for CounterProjector {
        const NAME: &'static str = "CounterProjector";
        const VERSION: &'static str = "1.0.0";

        fn project(
            current: Option<Box<dyn TagStatePayload>>,
            event: &Event,
        ) -> Box<dyn TagStatePayload> {
            let mut counter = current
                .and_then(|payload| payload.downcast_ref::<Counter>().cloned())
                .unwrap_or(Counter {
                    total: 0,
                    closed: false,
                });
            if let Some(added) = event.payload_as::<CountAdded>() {
                counter.total += added.amount;
            } else if event.payload_as::<CountClosed>().is_some() {
                counter.closed = true;
            }
            Box::new(counter)
        }
    }

    type Projection = TagMultiProjector<CounterProjector, DeviceGroup>;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn added(secs: u64, device: u32, amount: u64) -> Event {
        Event::new(&CountAdded { amount }, vec![format!("Device:{device}")], at(secs)).unwrap()
    }

    fn closed(secs: u64, device: u32) -> Event {
        Event::new(&CountClosed, vec![format!("Device:{device}")], at(secs)).unwrap()
    }

    fn threshold(secs: u64) -> SortableUniqueId {
        SortableUniqueId::threshold(at(secs))
    }

    fn total(projection: &Projection, device: u32) -> Option<u64> {
        projection
            .current_items()
            .get(&device)
            .and_then(|state| state.payload.downcast_ref::<Counter>())
            .map(|counter| counter.total)
    }

    #[test]
    fn folds_events_into_group_keys() {
        let t = threshold(500);
        let projection = Projection::initial()
            .apply(&added(100, 1, 3), Some(&t))
            .apply(&added(101, 1, 4), Some(&t))
            .apply(&added(102, 2, 1), Some(&t));

        assert_eq!(total(&projection, 1), Some(7));
        assert_eq!(total(&projection, 2), Some(1));
        assert_eq!(projection.current_items().get(&1).unwrap().version, 2);
        assert_eq!(projection.version(), 3);
    }

    #[test]
    fn unrelated_tag_groups_leave_the_map_untouched() {
        let t = threshold(500);
        let other = Event::new(
            &CountAdded { amount: 9 },
            vec!["Sensor:1".to_string()],
            at(100),
        )
        .unwrap();
        let projection = Projection::initial().apply(&other, Some(&t));

        assert!(projection.current_items().is_empty());
        // Bookkeeping still advances.
        assert_eq!(projection.version(), 1);
        assert_eq!(projection.last_event_id(), Some(other.id));
        assert_eq!(
            projection.last_sortable_unique_id(),
            Some(&other.sortable_unique_id)
        );
    }

    #[test]
    fn tombstone_payload_drops_the_entry() {
        let t = threshold(500);
        let projection = Projection::initial()
            .apply(&added(100, 1, 3), Some(&t))
            .apply(&closed(101, 1), Some(&t));

        assert!(!projection.current_items().contains_key(&1));

        // Closing again is an idempotent no-op on the map.
        let again = projection.apply(&closed(102, 1), Some(&t));
        assert!(!again.current_items().contains_key(&1));
        assert_eq!(again.version(), 3);
    }

    #[test]
    fn safe_projection_excludes_the_tentative_tail() {
        let t = threshold(150);
        let projection = Projection::initial()
            .apply(&added(100, 1, 3), Some(&t))
            .apply(&added(200, 1, 4), Some(&t));

        let safe = projection.safe_projection(&t);
        let unsafe_view = projection.unsafe_projection();
        assert_eq!(
            safe.items
                .get(&1)
                .unwrap()
                .payload
                .downcast_ref::<Counter>()
                .unwrap()
                .total,
            3
        );
        assert_eq!(
            unsafe_view
                .items
                .get(&1)
                .unwrap()
                .payload
                .downcast_ref::<Counter>()
                .unwrap()
                .total,
            7
        );
        assert_eq!(safe.version, 1);
        assert_eq!(unsafe_view.version, 2);
    }

    #[test]
    fn settle_promotes_the_tentative_tail() {
        let t = threshold(150);
        let projection = Projection::initial()
            .apply(&added(100, 1, 3), Some(&t))
            .apply(&added(200, 1, 4), Some(&t));
        assert_eq!(projection.unsafe_item_count(), 1);

        let settled = projection.settle(&threshold(300));
        assert_eq!(settled.unsafe_item_count(), 0);
        assert_eq!(total(&settled, 1), Some(7));
        // Bookkeeping is untouched.
        assert_eq!(settled.version(), 2);
        assert_eq!(
            settled.last_sortable_unique_id(),
            projection.last_sortable_unique_id()
        );
    }

    #[test]
    fn serialize_requires_a_threshold() {
        let projection = Projection::initial();
        assert!(matches!(
            projection.serialize(None),
            Err(SnapshotCodecError::MissingThreshold)
        ));
    }

    #[test]
    fn snapshot_round_trips_the_safe_view() {
        let t = threshold(500);
        let projection = Projection::initial()
            .apply(&added(100, 1, 3), Some(&t))
            .apply(&added(101, 2, 5), Some(&t))
            .apply(&added(600, 2, 100), Some(&t));

        let serialized = projection.serialize(Some(&t)).unwrap();
        assert_eq!(serialized.item_count, 2);
        assert!(serialized.original_size > serialized.compressed.len() || serialized.original_size < 64);

        let mut registry = DomainTypeRegistry::new();
        registry.register_payload::<Counter>();
        let restored = Projection::deserialize(&registry, &serialized.compressed).unwrap();

        // The tentative tail (the event at t=600) is not part of the snapshot.
        assert_eq!(total(&restored, 1), Some(3));
        assert_eq!(total(&restored, 2), Some(5));
        assert_eq!(restored.current_items().get(&2).unwrap().version, 1);
    }

    #[test]
    fn deserialize_skips_unresolvable_entries() {
        let doc = serde_json::json!({
            "v": 1,
            "items": [
                { "id": "1", "type": "Counter", "payload": { "total": 3, "closed": false }, "version": 1, "last": "0" },
                { "id": "2", "type": "Forgotten", "payload": {}, "version": 1, "last": "0" },
                { "id": "not-a-key", "type": "Counter", "payload": { "total": 9, "closed": false }, "version": 1, "last": "0" },
            ],
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serde_json::to_vec(&doc).unwrap())
            .unwrap();
        let bytes = encoder.finish().unwrap();

        let mut registry = DomainTypeRegistry::new();
        registry.register_payload::<Counter>();
        let restored = Projection::deserialize(&registry, &bytes).unwrap();

        assert_eq!(restored.current_items().len(), 1);
        assert_eq!(total(&restored, 1), Some(3));
    }

    #[test]
    fn deserialize_rejects_unknown_wire_versions() {
        let doc = serde_json::json!({ "v": 99, "items": [] });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serde_json::to_vec(&doc).unwrap())
            .unwrap();
        let bytes = encoder.finish().unwrap();

        let registry = DomainTypeRegistry::new();
        assert!(matches!(
            Projection::deserialize(&registry, &bytes),
            Err(SnapshotCodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn is_id_received_tracks_the_last_applied_position() {
        let t = threshold(500);
        let event = added(100, 1, 1);
        let marker = event.sortable_unique_id.clone();
        let projection = Projection::initial();
        assert!(!projection.is_id_received(&marker));

        let projection = projection.apply(&event, Some(&t));
        assert!(projection.is_id_received(&marker));
        assert!(!projection.is_id_received(&threshold(900)));
    }
}
