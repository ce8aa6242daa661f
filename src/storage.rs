//! In-memory authoritative caches for flags, segments, and flag sets.
//!
//! All writes go through the sync pipeline and land under a single
//! readers-writer lock; each write batch is applied whole or not at all.
//! Readers take a [`Snapshot`] (one read-lock acquisition) that stays
//! coherent for an entire multi-flag evaluation.
//!
//! Change numbers are monotonic non-decreasing: an apply carrying an older
//! `till` than the stored feed version is a no-op, which also makes
//! re-applying the same update idempotent.

pub mod redis;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::types::{Split, SplitStatus};

#[derive(Default)]
struct StorageInner {
    splits: HashMap<String, Arc<Split>>,
    flag_sets: HashMap<String, HashSet<String>>,
    segments: HashMap<String, SegmentEntry>,
    traffic_types: HashMap<String, usize>,
    change_number: i64,
}

#[derive(Default)]
struct SegmentEntry {
    keys: HashSet<String>,
    change_number: i64,
}

/// Outcome of applying a flag feed delta.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SplitApplyResult {
    /// Segments referenced by newly received definitions that storage has
    /// never fetched; the sync layer queues these for immediate fetch.
    pub new_segments: Vec<String>,
    pub updated: usize,
    pub removed: usize,
}

/// The normative storage implementation: everything lives in process memory.
pub struct InMemoryStorage {
    inner: RwLock<StorageInner>,
    flag_sets_filter: Option<HashSet<String>>,
}

impl InMemoryStorage {
    pub fn new(flag_sets_filter: Option<Vec<String>>) -> Self {
        let flag_sets_filter = flag_sets_filter
            .filter(|f| !f.is_empty())
            .map(|f| f.into_iter().collect());
        Self {
            inner: RwLock::new(StorageInner {
                change_number: -1,
                ..StorageInner::default()
            }),
            flag_sets_filter,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StorageInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Current change number of the flag feed (-1 before the first apply).
    pub fn change_number(&self) -> i64 {
        self.read().change_number
    }

    /// Change number of one segment (-1 if never fetched).
    pub fn segment_change_number(&self, name: &str) -> i64 {
        self.read()
            .segments
            .get(name)
            .map_or(-1, |s| s.change_number)
    }

    /// Apply a flag feed delta transactionally.
    ///
    /// Definitions outside the configured flag-set filter are dropped, and
    /// archived definitions are removed. The feed change number only moves
    /// forward; a stale `till` leaves storage untouched.
    pub fn update_splits(&self, changes: Vec<Split>, till: i64) -> SplitApplyResult {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut result = SplitApplyResult::default();
        if till < inner.change_number {
            return result;
        }

        for split in changes {
            let keep = split.status == SplitStatus::Active && self.passes_filter(&split);
            if keep {
                for segment in split.referenced_segments() {
                    if !inner.segments.contains_key(segment)
                        && !result.new_segments.iter().any(|s| s == segment)
                    {
                        result.new_segments.push(segment.to_string());
                    }
                }
                Self::insert_split(&mut inner, split);
                result.updated += 1;
            } else if Self::remove_split(&mut inner, &split.name) {
                result.removed += 1;
            }
        }

        inner.change_number = inner.change_number.max(till);
        result
    }

    /// Mark one flag killed with the given default treatment. Returns false
    /// when the flag is unknown or the notification is older than the
    /// stored definition.
    pub fn kill_split(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(existing) = inner.splits.get(name) else {
            return false;
        };
        if change_number <= existing.change_number {
            return false;
        }
        let mut split = (**existing).clone();
        split.killed = true;
        split.default_treatment = default_treatment.to_string();
        split.change_number = change_number;
        inner.splits.insert(name.to_string(), Arc::new(split));
        true
    }

    /// Apply one segment delta transactionally; stale `till`s are no-ops.
    pub fn update_segment(&self, name: &str, added: &[String], removed: &[String], till: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner.segments.entry(name.to_string()).or_default();
        if till < entry.change_number {
            return;
        }
        for key in added {
            entry.keys.insert(key.clone());
        }
        for key in removed {
            entry.keys.remove(key);
        }
        entry.change_number = entry.change_number.max(till);
    }

    /// Record a segment as known (fetched at least once) even when empty.
    pub fn register_segment(&self, name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.segments.entry(name.to_string()).or_default();
    }

    /// Names of every segment referenced by any stored flag.
    pub fn referenced_segments(&self) -> HashSet<String> {
        let inner = self.read();
        inner
            .splits
            .values()
            .flat_map(|s| s.referenced_segments().map(str::to_string))
            .collect()
    }

    /// Whether any stored flag uses the given traffic type.
    pub fn traffic_type_exists(&self, name: &str) -> bool {
        self.read().traffic_types.contains_key(name)
    }

    /// Drop every cached definition. Used on factory destroy.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = StorageInner {
            change_number: -1,
            ..StorageInner::default()
        };
    }

    /// One read-lock acquisition covering a whole multi-flag evaluation.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot { guard: self.read() }
    }

    fn passes_filter(&self, split: &Split) -> bool {
        match &self.flag_sets_filter {
            None => true,
            Some(filter) => split.sets.iter().any(|s| filter.contains(s)),
        }
    }

    fn insert_split(inner: &mut StorageInner, split: Split) {
        Self::unlink_split(inner, &split.name);
        for set in &split.sets {
            inner
                .flag_sets
                .entry(set.clone())
                .or_default()
                .insert(split.name.clone());
        }
        if let Some(tt) = &split.traffic_type_name {
            *inner.traffic_types.entry(tt.clone()).or_insert(0) += 1;
        }
        inner.splits.insert(split.name.clone(), Arc::new(split));
    }

    fn remove_split(inner: &mut StorageInner, name: &str) -> bool {
        Self::unlink_split(inner, name);
        inner.splits.remove(name).is_some()
    }

    // Detach an existing definition from the flag-set and traffic-type
    // indexes so the two stay symmetric with `splits`.
    fn unlink_split(inner: &mut StorageInner, name: &str) {
        let Some(old) = inner.splits.get(name).cloned() else {
            return;
        };
        for set in &old.sets {
            if let Some(members) = inner.flag_sets.get_mut(set) {
                members.remove(name);
                if members.is_empty() {
                    inner.flag_sets.remove(set);
                }
            }
        }
        if let Some(tt) = &old.traffic_type_name {
            if let Some(count) = inner.traffic_types.get_mut(tt) {
                *count -= 1;
                if *count == 0 {
                    inner.traffic_types.remove(tt);
                }
            }
        }
    }
}

/// Coherent read view over storage, held for at most one evaluation.
pub struct Snapshot<'a> {
    guard: RwLockReadGuard<'a, StorageInner>,
}

impl Snapshot<'_> {
    pub fn split(&self, name: &str) -> Option<Arc<Split>> {
        self.guard.splits.get(name).cloned()
    }

    pub fn segment_contains(&self, segment: &str, key: &str) -> bool {
        self.guard
            .segments
            .get(segment)
            .is_some_and(|s| s.keys.contains(key))
    }

    pub fn change_number(&self) -> i64 {
        self.guard.change_number
    }

    pub fn split_names(&self) -> Vec<String> {
        self.guard.splits.keys().cloned().collect()
    }

    pub fn all_splits(&self) -> Vec<Arc<Split>> {
        self.guard.splits.values().cloned().collect()
    }

    /// Flags belonging to any of the given flag sets, deduplicated and
    /// sorted by name so multi-flag results are stable.
    pub fn splits_for_sets(&self, sets: &[&str]) -> Vec<Arc<Split>> {
        let mut names: Vec<&String> = sets
            .iter()
            .filter_map(|set| self.guard.flag_sets.get(*set))
            .flatten()
            .collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| self.guard.splits.get(name).cloned())
            .collect()
    }
}
