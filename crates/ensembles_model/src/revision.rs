//! Per-store revisions and revision vectors.
//!
//! A [`Revision`] identifies one event's position in the log of the store
//! that created it. A [`RevisionSet`] holds at most one revision per store
//! and is used as a vector clock: the store-wise maximum is the join
//! ("furthest point any peer has reached") and the store-wise minimum is the
//! meet ("point every peer has incorporated").

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Store-local revision counter. The first event of a store has revision 1;
/// revision 0 means the store has produced nothing yet.
pub type RevisionNumber = i64;

/// Cross-store counter assigned when an event is created.
pub type GlobalCount = i64;

/// The position of one event in the log of one store.
///
/// Equality and hashing consider only the store and revision number. The
/// global count is an ordering hint carried along with the revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// Persistent store that produced the event.
    pub store_id: String,
    /// Strictly increasing number within the store.
    pub revision_number: RevisionNumber,
    /// Global count at the time the revision was assigned.
    pub global_count: GlobalCount,
}

impl Revision {
    /// Creates a revision.
    pub fn new(
        store_id: impl Into<String>,
        revision_number: RevisionNumber,
        global_count: GlobalCount,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            revision_number,
            global_count,
        }
    }

    /// Compares two revisions of the same store.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::IncomparableRevisions`] when the revisions
    /// belong to different stores.
    pub fn compare(&self, other: &Revision) -> ModelResult<Ordering> {
        if self.store_id != other.store_id {
            return Err(ModelError::IncomparableRevisions {
                left: self.store_id.clone(),
                right: other.store_id.clone(),
            });
        }
        Ok(self.revision_number.cmp(&other.revision_number))
    }

    /// Returns the next revision of the same store.
    #[must_use]
    pub fn successor(&self, global_count: GlobalCount) -> Revision {
        Revision::new(self.store_id.clone(), self.revision_number + 1, global_count)
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.store_id == other.store_id && self.revision_number == other.revision_number
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.store_id.hash(state);
        self.revision_number.hash(state);
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (gc {})",
            self.store_id, self.revision_number, self.global_count
        )
    }
}

/// Latest known revision per store.
///
/// Keyed by store identifier, so a store appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionSet {
    revisions: BTreeMap<String, Revision>,
}

impl RevisionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from revisions. When a store occurs more than once, the
    /// highest revision number is kept.
    pub fn from_revisions(revisions: impl IntoIterator<Item = Revision>) -> Self {
        let mut set = Self::new();
        for revision in revisions {
            set.include(revision);
        }
        set
    }

    /// Inserts a revision, replacing any existing entry for its store.
    /// Returns the replaced revision.
    pub fn insert(&mut self, revision: Revision) -> Option<Revision> {
        self.revisions.insert(revision.store_id.clone(), revision)
    }

    /// Inserts a revision unless the set already holds a higher one for
    /// the same store.
    pub fn include(&mut self, revision: Revision) {
        match self.revisions.entry(revision.store_id.clone()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(revision);
            }
            btree_map::Entry::Occupied(mut entry) => {
                if revision.revision_number > entry.get().revision_number {
                    entry.insert(revision);
                }
            }
        }
    }

    /// Removes the entry for a store.
    pub fn remove(&mut self, store_id: &str) -> Option<Revision> {
        self.revisions.remove(store_id)
    }

    /// Returns the revision recorded for a store.
    pub fn revision_for_store(&self, store_id: &str) -> Option<&Revision> {
        self.revisions.get(store_id)
    }

    /// Returns the revision number recorded for a store, or 0.
    pub fn revision_number_for_store(&self, store_id: &str) -> RevisionNumber {
        self.revisions
            .get(store_id)
            .map(|r| r.revision_number)
            .unwrap_or(0)
    }

    /// Returns true if the set has an entry for the store.
    pub fn has_revision_for_store(&self, store_id: &str) -> bool {
        self.revisions.contains_key(store_id)
    }

    /// Advances the store's revision by one. A store without an entry
    /// starts at revision 1.
    pub fn increment_revision_for_store(&mut self, store_id: &str, global_count: GlobalCount) {
        let next = self
            .revisions
            .get(store_id)
            .map(|r| r.successor(global_count))
            .unwrap_or_else(|| Revision::new(store_id, 1, global_count));
        self.revisions.insert(store_id.to_string(), next);
    }

    /// Store identifiers in ascending order.
    pub fn store_ids(&self) -> impl Iterator<Item = &str> {
        self.revisions.keys().map(String::as_str)
    }

    /// Revisions in ascending store order.
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values()
    }

    /// Number of stores in the set.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Store-wise minimum. Stores present in only one set pass through.
    #[must_use]
    pub fn store_wise_minimum(&self, other: &RevisionSet) -> RevisionSet {
        self.combine(other, |mine, theirs| {
            theirs.revision_number < mine.revision_number
        })
    }

    /// Store-wise maximum. Stores present in only one set pass through.
    #[must_use]
    pub fn store_wise_maximum(&self, other: &RevisionSet) -> RevisionSet {
        self.combine(other, |mine, theirs| {
            theirs.revision_number > mine.revision_number
        })
    }

    fn combine(
        &self,
        other: &RevisionSet,
        prefer_other: impl Fn(&Revision, &Revision) -> bool,
    ) -> RevisionSet {
        let mut result = self.clone();
        for theirs in other.iter() {
            match result.revisions.entry(theirs.store_id.clone()) {
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(theirs.clone());
                }
                btree_map::Entry::Occupied(mut entry) => {
                    if prefer_other(entry.get(), theirs) {
                        entry.insert(theirs.clone());
                    }
                }
            }
        }
        result
    }

    /// Minimum over the stores present in *every* set.
    ///
    /// Unlike [`store_wise_minimum`](Self::store_wise_minimum), a store
    /// missing from any set is left out of the result: its common point
    /// cannot be determined.
    pub fn common_minimum<'a>(sets: impl IntoIterator<Item = &'a RevisionSet>) -> RevisionSet {
        let mut iter = sets.into_iter();
        let Some(first) = iter.next() else {
            return RevisionSet::new();
        };
        let mut result = first.clone();
        for set in iter {
            result
                .revisions
                .retain(|store_id, mine| match set.revision_for_store(store_id) {
                    Some(theirs) => {
                        if theirs.revision_number < mine.revision_number {
                            *mine = theirs.clone();
                        }
                        true
                    }
                    None => false,
                });
        }
        result
    }

    /// Returns true if, for every store in `self`, `other` records an equal
    /// or higher revision.
    pub fn is_covered_by(&self, other: &RevisionSet) -> bool {
        self.iter().all(|revision| {
            other
                .revision_for_store(&revision.store_id)
                .is_some_and(|theirs| theirs.revision_number >= revision.revision_number)
        })
    }
}

impl FromIterator<Revision> for RevisionSet {
    fn from_iter<T: IntoIterator<Item = Revision>>(iter: T) -> Self {
        Self::from_revisions(iter)
    }
}

impl<'a> IntoIterator for &'a RevisionSet {
    type Item = &'a Revision;
    type IntoIter = btree_map::Values<'a, String, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.values()
    }
}
