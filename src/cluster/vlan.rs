//! VLAN tag pool for a single cluster
//!
//! The pool tracks which tags in the configured `[min, max)` range are free
//! and which are held by a network. Both sets sit behind one internal lock
//! that is never exposed and never held across an await, so take, return and
//! re-derivation are each linearizable.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Floor used when no configuration record bounds the range
pub const DEFAULT_MIN_VLAN: u16 = 2;

/// Ceiling (exclusive) used when no configuration record bounds the range
pub const DEFAULT_MAX_VLAN: u16 = 4095;

/// A VLAN identifier; tag 0 means "unset"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VlanTag(u16);

impl VlanTag {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for VlanTag {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for VlanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of usable tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanRange {
    pub min: u16,
    pub max: u16,
}

impl VlanRange {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, tag: VlanTag) -> bool {
        tag.0 >= self.min && tag.0 < self.max
    }

    pub fn len(&self) -> usize {
        self.max.saturating_sub(self.min) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tags(&self) -> impl Iterator<Item = VlanTag> {
        (self.min..self.max).map(VlanTag)
    }
}

impl Default for VlanRange {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_VLAN, DEFAULT_MAX_VLAN)
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// VLAN bounds declared by one cluster configuration record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vlan: Option<u16>,
}

impl VlanBounds {
    pub fn new(min_vlan: Option<u16>, max_vlan: Option<u16>) -> Self {
        Self { min_vlan, max_vlan }
    }
}

/// Derive the live range from every configuration record.
///
/// Takes the largest `min_vlan` and the smallest `max_vlan` across records,
/// starting from [`DEFAULT_MIN_VLAN`] and [`DEFAULT_MAX_VLAN`].
pub fn derive_range<'a>(bounds: impl IntoIterator<Item = &'a VlanBounds>) -> VlanRange {
    let mut range = VlanRange::default();
    for b in bounds {
        if let Some(min) = b.min_vlan {
            range.min = range.min.max(min);
        }
        if let Some(max) = b.max_vlan {
            range.max = range.max.min(max);
        }
    }
    range
}

/// What a re-derivation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RederiveOutcome {
    pub range: VlanRange,
    pub purged: usize,
    pub added: usize,
    pub available: usize,
}

/// Point-in-time copy of the pool contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub range: VlanRange,
    pub available: Vec<VlanTag>,
    pub assigned: Vec<VlanTag>,
}

#[derive(Debug)]
struct PoolInner {
    range: VlanRange,
    available: BTreeSet<VlanTag>,
    assigned: BTreeSet<VlanTag>,
}

#[derive(Debug)]
pub struct VlanPool {
    inner: Mutex<PoolInner>,
}

impl VlanPool {
    /// Create a pool with every tag of `range` available
    pub fn new(range: VlanRange) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                range,
                available: range.tags().collect(),
                assigned: BTreeSet::new(),
            }),
        }
    }

    /// Remove and return the lowest available tag, `None` when exhausted
    pub fn take(&self) -> Option<VlanTag> {
        let mut inner = self.inner.lock();
        let tag = inner.available.pop_first()?;
        inner.assigned.insert(tag);
        Some(tag)
    }

    /// Remove exactly `tag`; `false` (and no change) when it is not available
    pub fn take_specific(&self, tag: VlanTag) -> bool {
        let mut inner = self.inner.lock();
        if !inner.available.remove(&tag) {
            return false;
        }
        inner.assigned.insert(tag);
        true
    }

    /// Return a tag to the pool.
    ///
    /// Idempotent. Tags outside the current range are forgotten instead of
    /// re-inserted. Returns `true` only if the tag became available.
    pub fn give_back(&self, tag: VlanTag) -> bool {
        let mut inner = self.inner.lock();
        inner.assigned.remove(&tag);
        if !inner.range.contains(tag) {
            return false;
        }
        inner.available.insert(tag)
    }

    /// Apply new bounds: purge tags that fell out of range and add in-range
    /// tags that are neither available nor assigned.
    pub fn rederive(&self, range: VlanRange) -> RederiveOutcome {
        let mut inner = self.inner.lock();
        inner.range = range;

        let before = inner.available.len();
        inner.available.retain(|tag| range.contains(*tag));
        let purged = before - inner.available.len();

        let PoolInner {
            available,
            assigned,
            ..
        } = &mut *inner;
        let mut added = 0;
        for tag in range.tags() {
            if !assigned.contains(&tag) && available.insert(tag) {
                added += 1;
            }
        }

        RederiveOutcome {
            range,
            purged,
            added,
            available: available.len(),
        }
    }

    pub fn range(&self) -> VlanRange {
        self.inner.lock().range
    }

    pub fn available_len(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn assigned_len(&self) -> usize {
        self.inner.lock().assigned.len()
    }

    pub fn is_available(&self, tag: VlanTag) -> bool {
        self.inner.lock().available.contains(&tag)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock();
        PoolSnapshot {
            range: inner.range,
            available: inner.available.iter().copied().collect(),
            assigned: inner.assigned.iter().copied().collect(),
        }
    }
}

impl Default for VlanPool {
    fn default() -> Self {
        Self::new(VlanRange::default())
    }
}
