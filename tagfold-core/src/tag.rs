//! Tags, tag groups, and per-tag projected state.
//!
//! A tag is an opaque `"group:content"` identifier attached to events. Tags
//! group events independently of any aggregate boundary: one event may carry
//! tags from several groups, and each group keys its own projection. A
//! [`TagGroup`] describes how to turn a tag's content into a typed key.

use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize};

use crate::{event::TagStatePayload, ident::SortableUniqueId};

/// An opaque identifier attached to events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub group: String,
    pub content: String,
}

impl Tag {
    #[must_use]
    pub fn new(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            content: content.into(),
        }
    }

    /// Parse a raw `"group:content"` tag string.
    ///
    /// Returns `None` when the separator is missing or either part is empty.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (group, content) = raw.split_once(':')?;
        if group.is_empty() || content.is_empty() {
            return None;
        }
        Some(Self::new(group, content))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.content)
    }
}

/// How one tag group derives typed keys from tag content.
///
/// An integer-keyed group parses its content as an integer; a uuid-keyed
/// group parses a uuid; and so on. `key_of` returning `None` means the
/// content is malformed for this group and the tag is ignored.
pub trait TagGroup: Send + Sync + 'static {
    /// The group name, matched against the `group` part of raw tags.
    const NAME: &'static str;

    /// Typed key derived from tag content.
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn key_of(content: &str) -> Option<Self::Key>;

    fn content_of(key: &Self::Key) -> String;

    /// Reconstruct the full tag for a key.
    #[must_use]
    fn tag_of(key: &Self::Key) -> Tag {
        Tag::new(Self::NAME, Self::content_of(key))
    }
}

/// Identity of one projected state slice: a tag plus the projector that
/// derives state for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TagStateId {
    pub tag: Tag,
    pub projector_name: String,
}

impl TagStateId {
    #[must_use]
    pub fn new(tag: Tag, projector_name: impl Into<String>) -> Self {
        Self {
            tag,
            projector_name: projector_name.into(),
        }
    }
}

impl fmt::Display for TagStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.projector_name)
    }
}

/// Projected state for one tag under one projector.
///
/// Invariants maintained by the fold: `version` increments by exactly one
/// per applied event for this key, and `last_sorted_unique_id` strictly
/// increases. Removal is expressed by omission - a removed tag simply has no
/// `TagState` in the projection map.
#[derive(Clone, Debug)]
pub struct TagState {
    pub id: TagStateId,
    pub payload: Box<dyn TagStatePayload>,
    pub version: u64,
    pub last_sorted_unique_id: SortableUniqueId,
    pub projector_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_colon() {
        let tag = Tag::parse("Room:12:a").unwrap();
        assert_eq!(tag.group, "Room");
        assert_eq!(tag.content, "12:a");
    }

    #[test]
    fn parse_rejects_missing_separator_and_empty_parts() {
        assert_eq!(Tag::parse("Room"), None);
        assert_eq!(Tag::parse(":12"), None);
        assert_eq!(Tag::parse("Room:"), None);
    }

    #[test]
    fn display_round_trips() {
        let tag = Tag::new("Room", "12");
        assert_eq!(Tag::parse(&tag.to_string()), Some(tag));
    }

    struct RoomGroup;

    impl TagGroup for RoomGroup {
        const NAME: &'static str = "Room";
        type Key = u32;

        fn key_of(content: &str) -> Option<u32> {
            content.parse().ok()
        }

        fn content_of(key: &u32) -> String {
            key.to_string()
        }
    }

    #[test]
    fn integer_group_derives_keys_from_content() {
        assert_eq!(RoomGroup::key_of("12"), Some(12));
        assert_eq!(RoomGroup::key_of("twelve"), None);
        assert_eq!(RoomGroup::tag_of(&12), Tag::new("Room", "12"));
    }
}
