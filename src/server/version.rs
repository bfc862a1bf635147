//! Versioned value model: monotonic version stamps and stored values.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-process startup epoch type.
pub type Generation = u64;

/// The generation assigned on a node's first-ever start.
pub const FIRST_GENERATION: Generation = 1;

/// Strictly ordered version stamp: compared by generation, then by counter.
/// Generation 0 never occurs for real ids, so the all-zero stamp is the
/// empty/bottom element.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct MonotonicId {
    pub generation: Generation,
    pub counter: u64,
}

impl MonotonicId {
    /// Creates a real version stamp.
    pub fn new(generation: Generation, counter: u64) -> Self {
        debug_assert!(generation >= FIRST_GENERATION);
        MonotonicId {
            generation,
            counter,
        }
    }

    /// The empty stamp, less than any real one.
    pub const fn empty() -> Self {
        MonotonicId {
            generation: 0,
            counter: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}

impl fmt::Display for MonotonicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}.{}", self.generation, self.counter)
        }
    }
}

/// Issues strictly increasing version stamps for one coordinator generation.
///
/// Counters follow a wall-clock-like tick (microseconds since the Unix epoch)
/// but never repeat or go backwards, even if the system clock does.
#[derive(Debug)]
pub(crate) struct VersionClock {
    generation: Generation,
    last_counter: u64,
}

impl VersionClock {
    pub(crate) fn new(generation: Generation) -> Self {
        VersionClock {
            generation,
            last_counter: 0,
        }
    }

    /// Returns the next version stamp.
    pub(crate) fn tick(&mut self) -> MonotonicId {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.last_counter = now.max(self.last_counter + 1);
        MonotonicId::new(self.generation, self.last_counter)
    }
}

/// The versioned payload stored per key on every replica. Replaced wholesale
/// on every write.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    /// The value, or `None` for the empty sentinel.
    pub value: Option<String>,

    /// Version stamp assigned by the writing coordinator.
    pub version: MonotonicId,

    /// The writer's generation at write time.
    pub generation: Generation,
}

impl StoredValue {
    /// Sentinel representing absence of a value.
    pub const EMPTY: StoredValue = StoredValue {
        value: None,
        version: MonotonicId::empty(),
        generation: 0,
    };

    pub fn new(value: String, version: MonotonicId) -> Self {
        StoredValue {
            value: Some(value),
            generation: version.generation,
            version,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.version.is_empty()
    }

    /// Total order used to pick the latest of divergent replica values:
    /// version first, with the value itself as a deterministic tie-break.
    pub fn cmp_latest(&self, other: &StoredValue) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.value.cmp(&other.value))
    }

    /// Picks the latest value among the given ones, or `None` if empty.
    pub fn latest<'a>(
        values: impl IntoIterator<Item = &'a StoredValue>,
    ) -> Option<&'a StoredValue> {
        values.into_iter().max_by(|a, b| a.cmp_latest(b))
    }
}

impl Default for StoredValue {
    fn default() -> Self {
        Self::EMPTY
    }
}
