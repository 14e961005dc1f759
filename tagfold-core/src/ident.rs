//! Sortable unique identifiers.
//!
//! A [`SortableUniqueId`] is a globally unique, time-ordered string token.
//! It serves double duty as an event's position in the log and as a
//! consistency threshold marker: two ids compare by plain lexicographic
//! ordering, so "at or before this point in time" is a string comparison.
//!
//! The wire form is 30 ASCII digits: a 19-digit zero-padded count of
//! 100-nanosecond ticks since the Unix epoch, followed by an 11-digit
//! zero-padded remainder derived from the event's uuid. The tick prefix
//! makes the creation instant recoverable via [`SortableUniqueId::timestamp`],
//! which the safety-window machinery uses to measure delivery lag.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TICK_DIGITS: usize = 19;
const SUFFIX_DIGITS: usize = 11;
const NANOS_PER_TICK: u64 = 100;
const SUFFIX_MOD: u128 = 100_000_000_000;

/// Globally unique, time-ordered identifier.
///
/// Ids generated later always compare greater than ids generated earlier
/// (producer clocks permitting), and the uuid-derived suffix breaks ties
/// between ids generated within the same tick. Because ids are globally
/// unique, no tie-break rule beyond string comparison is needed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// Generate an id for an event created at `at`, disambiguated by `id`.
    #[must_use]
    pub fn generate(at: SystemTime, id: Uuid) -> Self {
        let suffix = id.as_u128() % SUFFIX_MOD;
        Self(format!(
            "{:0tick$}{:0suffix$}",
            ticks_since_epoch(at),
            suffix,
            tick = TICK_DIGITS,
            suffix = SUFFIX_DIGITS
        ))
    }

    /// Generate an id for the current instant.
    #[must_use]
    pub fn now(id: Uuid) -> Self {
        Self::generate(SystemTime::now(), id)
    }

    /// Build a threshold marker for `at`.
    ///
    /// The suffix is all zeros, so every real id generated at the same
    /// instant compares greater: a threshold admits events strictly from
    /// earlier ticks plus nothing from its own tick.
    #[must_use]
    pub fn threshold(at: SystemTime) -> Self {
        Self(format!(
            "{:0tick$}{:0suffix$}",
            ticks_since_epoch(at),
            0,
            tick = TICK_DIGITS,
            suffix = SUFFIX_DIGITS
        ))
    }

    /// Recover the creation instant embedded in the tick prefix.
    ///
    /// Returns `None` for malformed ids (wrong length or non-digit prefix).
    #[must_use]
    pub fn timestamp(&self) -> Option<SystemTime> {
        let ticks: u64 = self.0.get(..TICK_DIGITS)?.parse().ok()?;
        UNIX_EPOCH.checked_add(Duration::from_nanos(ticks.checked_mul(NANOS_PER_TICK)?))
    }

    /// Whether this id falls at or before the given threshold.
    #[must_use]
    pub fn is_settled_by(&self, threshold: &Self) -> bool {
        self <= threshold
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SortableUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SortableUniqueId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn ticks_since_epoch(at: SystemTime) -> u64 {
    let nanos = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    u64::try_from(nanos / u128::from(NANOS_PER_TICK)).unwrap_or(u64::MAX)
}
