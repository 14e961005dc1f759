//! Dual safe/unsafe projection state.
//!
//! [`SafeUnsafeProjectionState`] materializes a live key-to-value projection
//! while also offering a deterministic "as of a point" view. Events may
//! arrive out of global order within a short window (multi-partition
//! delivery, clock skew); the engine tolerates that by splitting reads:
//!
//! - the **current** view reflects every applied event, including the
//!   possibly-revised tail beyond the threshold
//! - the **safe** view is recomputed strictly from events at or before a
//!   threshold, so identical history plus an identical threshold always
//!   yields identical output, regardless of delivery order past the
//!   threshold
//!
//! The engine is a persistent value: processing returns a new state and
//! never mutates in place. Callers serialize calls per instance.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

use uuid::Uuid;

use crate::{event::Event, ident::SortableUniqueId};

/// Safe baseline for a key with tentative modifications.
///
/// `safe` is the value as of the last settled event (`None` when the key
/// did not exist below the threshold); `unsafe_events` are the buffered
/// events beyond the threshold, in arrival order.
#[derive(Clone, Debug)]
struct SafeStateBackup<V> {
    safe: Option<V>,
    unsafe_events: Vec<Event>,
}

/// Generic dual-view fold container.
///
/// `K` is the projection key, `V` the projected value. The fold itself is
/// supplied per call as a pair of pure functions: `get_affected_keys`
/// derives zero or more keys from an event, and `project_item` folds one
/// event into one key's value (`None` removes the entry).
#[derive(Clone, Debug)]
pub struct SafeUnsafeProjectionState<K, V> {
    current: HashMap<K, V>,
    backups: HashMap<K, SafeStateBackup<V>>,
    processed_event_ids: HashSet<Uuid>,
    last_threshold: Option<SortableUniqueId>,
}

impl<K, V> Default for SafeUnsafeProjectionState<K, V> {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            backups: HashMap::new(),
            processed_event_ids: HashSet::new(),
            last_threshold: None,
        }
    }
}

impl<K, V> SafeUnsafeProjectionState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a state from an already-collapsed map.
    ///
    /// Used when restoring a deserialized snapshot: every entry is treated
    /// as finalized history with no buffered tail.
    #[must_use]
    pub fn from_current_data(current: HashMap<K, V>) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    /// Fold one event into the projection, returning the new state.
    ///
    /// Events at or before `threshold` (or every event, when `threshold` is
    /// `None`) fold directly into settled state. Events beyond it fold into
    /// the current view but are buffered per key so the safe view can be
    /// recomputed later. When the threshold advances, buffered events that
    /// fell below it are replayed in id order into the safe baseline.
    ///
    /// Duplicate event ids are ignored without error.
    #[must_use]
    pub fn process_event<F, P>(
        &self,
        event: &Event,
        get_affected_keys: F,
        project_item: P,
        threshold: Option<&SortableUniqueId>,
    ) -> Self
    where
        F: Fn(&Event) -> Vec<K>,
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        let mut state = self.clone();

        if let Some(threshold) = threshold {
            if state.last_threshold.as_ref() != Some(threshold) && !state.backups.is_empty() {
                state = state.promote_newly_safe(threshold, &get_affected_keys, &project_item);
            }
            state.last_threshold = Some(threshold.clone());
        }

        let affected = get_affected_keys(event);
        if affected.is_empty() || state.processed_event_ids.contains(&event.id) {
            return state;
        }

        let is_settled = threshold.map_or(true, |t| event.sortable_unique_id.is_settled_by(t));
        if is_settled {
            state.apply_settled(event, &affected, &project_item);
        } else {
            state.apply_tentative(event, &affected, &project_item);
        }
        state
    }

    /// Fold a batch of events in order.
    #[must_use]
    pub fn process_events<'a, F, P, I>(
        &self,
        events: I,
        get_affected_keys: F,
        project_item: P,
        threshold: Option<&SortableUniqueId>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
        F: Fn(&Event) -> Vec<K>,
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        let mut state = self.clone();
        for event in events {
            state = state.process_event(event, &get_affected_keys, &project_item, threshold);
        }
        state
    }

    /// Advance the threshold without folding an event.
    ///
    /// Buffered events at or below the new threshold are replayed into
    /// their safe baselines exactly as if the threshold had advanced
    /// through [`process_event`](Self::process_event).
    #[must_use]
    pub fn settle<F, P>(
        &self,
        threshold: &SortableUniqueId,
        get_affected_keys: F,
        project_item: P,
    ) -> Self
    where
        F: Fn(&Event) -> Vec<K>,
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        if self.last_threshold.as_ref() == Some(threshold) || self.backups.is_empty() {
            let mut state = self.clone();
            state.last_threshold = Some(threshold.clone());
            return state;
        }
        self.promote_newly_safe(threshold, &get_affected_keys, &project_item)
    }

    /// The full, possibly-tentative view.
    #[must_use]
    pub fn get_current_state(&self) -> &HashMap<K, V> {
        &self.current
    }

    /// Deterministic view as of `threshold`.
    ///
    /// Keys whose history is fully settled are taken from the current view;
    /// keys with buffered modifications are recomputed from their safe
    /// baseline using only buffered events at or before the threshold. A
    /// key with zero settled events is simply absent. Pure: never mutates
    /// the current data.
    #[must_use]
    pub fn get_safe_state<F, P>(
        &self,
        threshold: &SortableUniqueId,
        get_affected_keys: F,
        project_item: P,
    ) -> HashMap<K, V>
    where
        F: Fn(&Event) -> Vec<K>,
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        let mut result = HashMap::new();

        if self.last_threshold.as_ref() == Some(threshold) {
            // Baselines are already maintained relative to this threshold.
            for (key, backup) in &self.backups {
                if let Some(value) = &backup.safe {
                    result.insert(key.clone(), value.clone());
                }
            }
        } else {
            for (key, backup) in &self.backups {
                let mut now_safe: Vec<&Event> = backup
                    .unsafe_events
                    .iter()
                    .filter(|e| e.sortable_unique_id.is_settled_by(threshold))
                    .collect();
                now_safe.sort_by(|a, b| a.sortable_unique_id.cmp(&b.sortable_unique_id));

                let mut value = backup.safe.clone();
                let mut seen = HashSet::new();
                for event in now_safe {
                    if !seen.insert(event.id) {
                        continue;
                    }
                    if get_affected_keys(event).contains(key) {
                        value = project_item(key, value.take(), event);
                    }
                }
                if let Some(value) = value {
                    result.insert(key.clone(), value);
                }
            }
        }

        for (key, value) in &self.current {
            if !self.backups.contains_key(key) {
                result.insert(key.clone(), value.clone());
            }
        }
        result
    }

    /// Whether a key has buffered modifications beyond the last threshold.
    #[must_use]
    pub fn is_item_unsafe(&self, key: &K) -> bool {
        self.backups.contains_key(key)
    }

    /// Keys whose history is fully settled.
    pub fn safe_keys(&self) -> impl Iterator<Item = &K> {
        self.current
            .keys()
            .filter(move |key| !self.backups.contains_key(key))
    }

    /// Keys with buffered modifications.
    pub fn unsafe_keys(&self) -> impl Iterator<Item = &K> {
        self.backups.keys()
    }

    /// Buffered events for one key, in arrival order.
    #[must_use]
    pub fn unsafe_events_for(&self, key: &K) -> &[Event] {
        self.backups
            .get(key)
            .map_or(&[], |backup| backup.unsafe_events.as_slice())
    }

    /// All buffered events across keys, deduplicated and sorted by id.
    #[must_use]
    pub fn all_unsafe_events(&self) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut events: Vec<Event> = self
            .backups
            .values()
            .flat_map(|backup| backup.unsafe_events.iter())
            .filter(|event| seen.insert(event.id))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.sortable_unique_id.cmp(&b.sortable_unique_id));
        events
    }

    /// Replay buffered events that fell at or below the new threshold into
    /// their safe baselines, rebuilding the current view for keys that
    /// still carry a tentative tail.
    fn promote_newly_safe<F, P>(&self, threshold: &SortableUniqueId, get_affected_keys: &F, project_item: &P) -> Self
    where
        F: Fn(&Event) -> Vec<K>,
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        let mut current = self.current.clone();
        let mut backups = HashMap::new();
        let mut processed = self.processed_event_ids.clone();

        for (key, backup) in &self.backups {
            let (mut now_safe, still_unsafe): (Vec<Event>, Vec<Event>) = backup
                .unsafe_events
                .iter()
                .cloned()
                .partition(|e| e.sortable_unique_id.is_settled_by(threshold));

            if now_safe.is_empty() {
                backups.insert(key.clone(), backup.clone());
                continue;
            }

            now_safe.sort_by(|a, b| a.sortable_unique_id.cmp(&b.sortable_unique_id));

            let mut safe_value = backup.safe.clone();
            let mut seen = HashSet::new();
            for event in &now_safe {
                processed.remove(&event.id);
                if !seen.insert(event.id) {
                    continue;
                }
                if get_affected_keys(event).contains(key) {
                    safe_value = project_item(key, safe_value.take(), event);
                }
            }

            if still_unsafe.is_empty() {
                // Fully settled: the id-ordered replay is canonical, so the
                // current view converges on it as well.
                match safe_value {
                    Some(value) => {
                        current.insert(key.clone(), value);
                    }
                    None => {
                        current.remove(key);
                    }
                }
            } else {
                let mut tentative = safe_value.clone();
                for event in &still_unsafe {
                    if get_affected_keys(event).contains(key) {
                        tentative = project_item(key, tentative.take(), event);
                    }
                }
                match tentative {
                    Some(value) => {
                        current.insert(key.clone(), value);
                    }
                    None => {
                        current.remove(key);
                    }
                }
                backups.insert(
                    key.clone(),
                    SafeStateBackup {
                        safe: safe_value,
                        unsafe_events: still_unsafe,
                    },
                );
            }
        }

        Self {
            current,
            backups,
            processed_event_ids: processed,
            last_threshold: Some(threshold.clone()),
        }
    }

    fn apply_settled<P>(&mut self, event: &Event, affected: &[K], project_item: &P)
    where
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        for key in affected {
            if let Some(backup) = self.backups.get_mut(key) {
                // The key has a tentative tail; settle into the baseline and
                // leave the current view (which has the tail applied) alone.
                backup.safe = project_item(key, backup.safe.take(), event);
            } else {
                let previous = self.current.remove(key);
                if let Some(value) = project_item(key, previous, event) {
                    self.current.insert(key.clone(), value);
                }
            }
        }
    }

    fn apply_tentative<P>(&mut self, event: &Event, affected: &[K], project_item: &P)
    where
        P: Fn(&K, Option<V>, &Event) -> Option<V>,
    {
        self.processed_event_ids.insert(event.id);

        for key in affected {
            if let Some(backup) = self.backups.get_mut(key) {
                if backup.unsafe_events.iter().any(|e| e.id == event.id) {
                    continue;
                }
                backup.unsafe_events.push(event.clone());
                let previous = self.current.remove(key);
                if let Some(value) = project_item(key, previous, event) {
                    self.current.insert(key.clone(), value);
                }
            } else {
                let baseline = self.current.get(key).cloned();
                match project_item(key, baseline.clone(), event) {
                    Some(value) => {
                        self.current.insert(key.clone(), value);
                        self.backups.insert(
                            key.clone(),
                            SafeStateBackup {
                                safe: baseline,
                                unsafe_events: vec![event.clone()],
                            },
                        );
                    }
                    None => {
                        // A tentative removal of an existing entry must keep
                        // the settled baseline recoverable.
                        if baseline.is_some() {
                            self.current.remove(key);
                            self.backups.insert(
                                key.clone(),
                                SafeStateBackup {
                                    safe: baseline,
                                    unsafe_events: vec![event.clone()],
                                },
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::EventPayload;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Delta {
        amount: i64,
        remove: bool,
    }

    impl EventPayload for Delta {
        const TYPE_NAME: &'static str = "Delta";
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn delta_event(secs: u64, item: u32, amount: i64) -> Event {
        Event::new(
            &Delta {
                amount,
                remove: false,
            },
            vec![format!("Item:{item}")],
            at(secs),
        )
        .unwrap()
    }

    fn remove_event(secs: u64, item: u32) -> Event {
        Event::new(
            &Delta {
                amount: 0,
                remove: true,
            },
            vec![format!("Item:{item}")],
            at(secs),
        )
        .unwrap()
    }

    fn keys(event: &Event) -> Vec<u32> {
        event
            .parsed_tags()
            .filter(|tag| tag.group == "Item")
            .filter_map(|tag| tag.content.parse().ok())
            .collect()
    }

    fn fold(_key: &u32, current: Option<i64>, event: &Event) -> Option<i64> {
        let delta: Delta = event.payload_as().unwrap();
        if delta.remove {
            None
        } else {
            Some(current.unwrap_or(0) + delta.amount)
        }
    }

    fn threshold(secs: u64) -> SortableUniqueId {
        SortableUniqueId::threshold(at(secs))
    }

    #[test]
    fn settled_events_fold_directly_into_current() {
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&threshold(200)))
            .process_event(&delta_event(101, 1, 2), keys, fold, Some(&threshold(200)));

        assert_eq!(state.get_current_state().get(&1), Some(&7));
        assert!(!state.is_item_unsafe(&1));
    }

    #[test]
    fn tentative_events_show_in_current_but_not_safe() {
        let t = threshold(150);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&t))
            .process_event(&delta_event(200, 1, 2), keys, fold, Some(&t));

        assert_eq!(state.get_current_state().get(&1), Some(&7));
        assert!(state.is_item_unsafe(&1));
        assert_eq!(state.get_safe_state(&t, keys, fold).get(&1), Some(&5));
    }

    #[test]
    fn advancing_threshold_settles_buffered_events() {
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&threshold(150)))
            .process_event(&delta_event(200, 1, 2), keys, fold, Some(&threshold(150)))
            .process_event(&delta_event(120, 2, 1), keys, fold, Some(&threshold(300)));

        assert!(!state.is_item_unsafe(&1));
        let safe = state.get_safe_state(&threshold(300), keys, fold);
        assert_eq!(safe.get(&1), Some(&7));
        assert_eq!(safe.get(&2), Some(&1));
    }

    #[test]
    fn safe_view_is_deterministic_across_delivery_orders() {
        let a = delta_event(100, 1, 5);
        let b = delta_event(200, 1, 2);
        let c = delta_event(210, 1, 10);
        let t = threshold(150);

        let forward = SafeUnsafeProjectionState::new().process_events([&a, &b, &c], keys, fold, Some(&t));
        let reversed = SafeUnsafeProjectionState::new().process_events([&a, &c, &b], keys, fold, Some(&t));

        assert_eq!(
            forward.get_safe_state(&t, keys, fold),
            reversed.get_safe_state(&t, keys, fold)
        );
        // A later threshold settles the tail identically in both.
        let late = threshold(400);
        assert_eq!(
            forward.get_safe_state(&late, keys, fold),
            reversed.get_safe_state(&late, keys, fold)
        );
    }

    #[test]
    fn settle_promotes_buffered_events_without_a_new_event() {
        let t = threshold(150);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&t))
            .process_event(&delta_event(200, 1, 2), keys, fold, Some(&t));
        assert!(state.is_item_unsafe(&1));

        let settled = state.settle(&threshold(300), keys, fold);
        assert!(!settled.is_item_unsafe(&1));
        assert_eq!(settled.get_current_state().get(&1), Some(&7));
        assert_eq!(
            settled.get_safe_state(&threshold(300), keys, fold).get(&1),
            Some(&7)
        );
    }

    #[test]
    fn duplicate_tentative_events_apply_once() {
        let event = delta_event(200, 1, 5);
        let t = threshold(150);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 1), keys, fold, Some(&t))
            .process_event(&event, keys, fold, Some(&t))
            .process_event(&event, keys, fold, Some(&t));

        assert_eq!(state.get_current_state().get(&1), Some(&6));
        assert_eq!(state.unsafe_events_for(&1).len(), 1);
    }

    #[test]
    fn tentative_removal_hides_current_but_keeps_safe_baseline() {
        let t = threshold(150);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&t))
            .process_event(&remove_event(200, 1), keys, fold, Some(&t));

        assert!(!state.get_current_state().contains_key(&1));
        assert_eq!(state.get_safe_state(&t, keys, fold).get(&1), Some(&5));

        // Once the removal settles, the key is gone from both views.
        let late = threshold(300);
        let settled = state.process_event(&delta_event(250, 2, 1), keys, fold, Some(&late));
        assert!(!settled.get_current_state().contains_key(&1));
        assert!(!settled.get_safe_state(&late, keys, fold).contains_key(&1));
    }

    #[test]
    fn settled_removal_drops_the_key() {
        let t = threshold(300);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, Some(&t))
            .process_event(&remove_event(110, 1), keys, fold, Some(&t));

        assert!(!state.get_current_state().contains_key(&1));
        assert!(!state.get_safe_state(&t, keys, fold).contains_key(&1));
    }

    #[test]
    fn events_with_no_affected_keys_are_a_no_op() {
        let event = Event::new(
            &Delta {
                amount: 1,
                remove: false,
            },
            vec!["Other:1".to_string()],
            at(100),
        )
        .unwrap();
        let state = SafeUnsafeProjectionState::new().process_event(&event, keys, fold, Some(&threshold(200)));
        assert!(state.get_current_state().is_empty());
    }

    #[test]
    fn from_current_data_treats_entries_as_settled() {
        let mut map = HashMap::new();
        map.insert(1u32, 42i64);
        let state = SafeUnsafeProjectionState::from_current_data(map);

        assert_eq!(state.get_current_state().get(&1), Some(&42));
        assert!(!state.is_item_unsafe(&1));
        assert_eq!(state.get_safe_state(&threshold(1), keys, fold).get(&1), Some(&42));
    }

    #[test]
    fn no_threshold_treats_every_event_as_settled() {
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 5), keys, fold, None)
            .process_event(&delta_event(200, 1, 2), keys, fold, None);

        assert_eq!(state.get_current_state().get(&1), Some(&7));
        assert!(!state.is_item_unsafe(&1));
    }

    #[test]
    fn all_unsafe_events_are_sorted_and_deduplicated() {
        let t = threshold(150);
        let late_b = delta_event(300, 2, 1);
        let late_a = delta_event(200, 1, 1);
        let state = SafeUnsafeProjectionState::new()
            .process_event(&delta_event(100, 1, 1), keys, fold, Some(&t))
            .process_event(&delta_event(100, 2, 1), keys, fold, Some(&t))
            .process_event(&late_b, keys, fold, Some(&t))
            .process_event(&late_a, keys, fold, Some(&t));

        let buffered = state.all_unsafe_events();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].id, late_a.id);
        assert_eq!(buffered[1].id, late_b.id);
    }
}
