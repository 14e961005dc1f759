//! Events, payload contracts, and projector functions.
//!
//! This module holds the value types and traits that flow through every
//! projection:
//!
//! - [`Event`] - an immutable, tag-annotated log entry
//! - [`EventPayload`] - marker trait naming an event payload type
//! - [`TagStatePayload`] - object-safe contract for projected payloads,
//!   including the explicit tombstone check
//! - [`PayloadType`] - the trait users implement; a blanket impl lifts it
//!   into `TagStatePayload`
//! - [`TagProjector`] - the pure fold step for one projector

use std::any::Any;

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{ident::SortableUniqueId, tag::Tag};

/// An immutable event from the append-only log.
///
/// Tags are carried as raw `"group:content"` strings; typed key extraction
/// happens at the projection boundary via [`Tag::parse`] and
/// [`TagGroup::key_of`](crate::tag::TagGroup::key_of).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Event {
    /// Unique event identity, used for duplicate suppression.
    pub id: Uuid,
    /// Position in the log and embedded creation instant.
    pub sortable_unique_id: SortableUniqueId,
    /// Registered name of the payload type.
    pub payload_type_name: String,
    /// Serialized payload bytes (JSON).
    pub payload: Vec<u8>,
    /// Raw tag strings attached at append time.
    pub tags: Vec<String>,
}

impl Event {
    /// Build an event for `payload` created at `at`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn new<T: EventPayload>(
        payload: &T,
        tags: Vec<String>,
        at: std::time::SystemTime,
    ) -> Result<Self, serde_json::Error> {
        let id = Uuid::new_v4();
        Ok(Self {
            id,
            sortable_unique_id: SortableUniqueId::generate(at, id),
            payload_type_name: T::TYPE_NAME.to_string(),
            payload: serde_json::to_vec(payload)?,
            tags,
        })
    }

    /// Decode the payload as `T`.
    ///
    /// Returns `None` when the event carries a different payload type;
    /// projectors use this to pattern-match on event kinds.
    #[must_use]
    pub fn payload_as<T: EventPayload + DeserializeOwned>(&self) -> Option<T> {
        if self.payload_type_name != T::TYPE_NAME {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }

    /// Iterate the event's tags in parsed form, skipping malformed entries.
    pub fn parsed_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.tags.iter().filter_map(|raw| Tag::parse(raw))
    }
}

/// Marker trait naming an event payload type.
///
/// The name is stored alongside the serialized bytes so consumers can route
/// payloads back to the correct type without inspecting their shape.
pub trait EventPayload: Serialize {
    const TYPE_NAME: &'static str;
}

/// The trait projected-payload types implement.
///
/// `TYPE_NAME` keys the payload in the
/// [`DomainTypeRegistry`](crate::registry::DomainTypeRegistry) so snapshots
/// can resolve entries back to concrete types. `is_tombstone` is the
/// explicit removal contract: when a fold step produces a tombstone, the
/// entry is dropped from the projection instead of being stored.
pub trait PayloadType: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    /// Whether this payload marks its entry as logically removed.
    fn is_tombstone(&self) -> bool {
        false
    }
}

/// Object-safe view of a projected payload.
///
/// You never implement this trait yourself - the blanket impl covers every
/// [`PayloadType`]. It exists so [`TagState`](crate::tag::TagState) can hold
/// payloads of any registered type behind one box.
pub trait TagStatePayload: Any + Send + Sync {
    /// Registered type name, identical to [`PayloadType::TYPE_NAME`].
    fn type_name(&self) -> &'static str;

    /// Whether this payload marks its entry as logically removed.
    fn is_tombstone(&self) -> bool;

    /// Encode the payload as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn clone_payload(&self) -> Box<dyn TagStatePayload>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: PayloadType> TagStatePayload for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn is_tombstone(&self) -> bool {
        PayloadType::is_tombstone(self)
    }

    fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_payload(&self) -> Box<dyn TagStatePayload> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn TagStatePayload> {
    fn clone(&self) -> Self {
        self.clone_payload()
    }
}

impl dyn TagStatePayload {
    /// Downcast to a concrete payload type.
    #[must_use]
    pub fn downcast_ref<T: PayloadType>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

impl std::fmt::Debug for dyn TagStatePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagStatePayload")
            .field("type_name", &self.type_name())
            .field("is_tombstone", &self.is_tombstone())
            .finish()
    }
}

/// Pure fold step binding events to one projected payload shape.
///
/// `project` receives the previous payload for a key (or `None` for a key
/// seen for the first time) and must not depend on anything but its
/// arguments: the dual-view engine replays it against the same events in
/// different orders and relies on identical results.
pub trait TagProjector: Send + Sync + 'static {
    /// Stable projector name, part of every
    /// [`TagStateId`](crate::tag::TagStateId).
    const NAME: &'static str;

    /// Projector logic version. Snapshots written under a different version
    /// are incompatible and trigger a rebuild from the log.
    const VERSION: &'static str;

    fn project(current: Option<Box<dyn TagStatePayload>>, event: &Event) -> Box<dyn TagStatePayload>;
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use serde::Deserialize;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct TemperatureRead {
        celsius: i32,
    }

    impl EventPayload for TemperatureRead {
        const TYPE_NAME: &'static str = "TemperatureRead";
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Reading {
        celsius: i32,
        retired: bool,
    }

    impl PayloadType for Reading {
        const TYPE_NAME: &'static str = "Reading";

        fn is_tombstone(&self) -> bool {
            self.retired
        }
    }

    fn at(secs: u64) -> std::time::SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn payload_as_decodes_matching_type() {
        let event = Event::new(
            &TemperatureRead { celsius: 21 },
            vec!["Station:1".to_string()],
            at(1_000),
        )
        .unwrap();
        assert_eq!(
            event.payload_as::<TemperatureRead>(),
            Some(TemperatureRead { celsius: 21 })
        );
    }

    #[test]
    fn payload_as_rejects_other_types() {
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        struct Other;
        impl EventPayload for Other {
            const TYPE_NAME: &'static str = "Other";
        }

        let event = Event::new(&TemperatureRead { celsius: 21 }, vec![], at(1_000)).unwrap();
        assert_eq!(event.payload_as::<Other>(), None);
    }

    #[test]
    fn parsed_tags_skips_malformed_entries() {
        let event = Event {
            id: Uuid::new_v4(),
            sortable_unique_id: SortableUniqueId::now(Uuid::new_v4()),
            payload_type_name: "TemperatureRead".to_string(),
            payload: b"{}".to_vec(),
            tags: vec!["Station:1".to_string(), "garbage".to_string()],
        };
        let tags: Vec<Tag> = event.parsed_tags().collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].group, "Station");
        assert_eq!(tags[0].content, "1");
    }

    #[test]
    fn boxed_payload_round_trips_through_clone_and_downcast() {
        let boxed: Box<dyn TagStatePayload> = Box::new(Reading {
            celsius: 5,
            retired: false,
        });
        let cloned = boxed.clone();
        assert_eq!(cloned.type_name(), "Reading");
        assert!(!cloned.is_tombstone());
        assert_eq!(cloned.downcast_ref::<Reading>().unwrap().celsius, 5);
    }

    #[test]
    fn tombstone_flag_surfaces_through_the_object_view() {
        let boxed: Box<dyn TagStatePayload> = Box::new(Reading {
            celsius: 5,
            retired: true,
        });
        assert!(boxed.is_tombstone());
    }
}
