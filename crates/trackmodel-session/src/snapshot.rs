//! Snapshot store: the values last known to match the backing store.
//!
//! A snapshot holds the scalar field values and the many-to-many collection
//! links of one tracked entry as of its last successful flush (or load).
//! Diffing the entity's current row against it is what distinguishes
//! Modified from Unchanged.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;
use trackmodel_core::{EntryId, Link, Value};

/// Baseline values of one entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    fields: Vec<(&'static str, Value)>,
    collections: BTreeMap<&'static str, BTreeSet<Link>>,
    taken_at: Instant,
}

impl Snapshot {
    /// Snapshot of a row and its collections.
    pub fn new(fields: Vec<(&'static str, Value)>, collections: Vec<(&'static str, Vec<Link>)>) -> Self {
        Self {
            fields,
            collections: collections
                .into_iter()
                .map(|(name, links)| (name, links.into_iter().collect()))
                .collect(),
            taken_at: Instant::now(),
        }
    }

    /// Snapshot with collection links only: every scalar field diffs as changed.
    pub fn collections_only(collections: Vec<(&'static str, Vec<Link>)>) -> Self {
        Self::new(Vec::new(), collections)
    }

    pub fn fields(&self) -> &[(&'static str, Value)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn collection(&self, name: &str) -> Option<&BTreeSet<Link>> {
        self.collections.get(name)
    }

    pub fn collections(&self) -> &BTreeMap<&'static str, BTreeSet<Link>> {
        &self.collections
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Fields whose current value differs from the snapshot.
    ///
    /// A field present on only one side is reported with `None` on the
    /// other side, which keeps "absent" distinct from `Value::Null`.
    pub fn diff(&self, current: &[(&'static str, Value)]) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        for (name, value) in current {
            match self.field(name) {
                Some(old) if old.same_value(value) => {}
                old => changes.push(FieldChange {
                    field: name,
                    old: old.cloned(),
                    new: Some(value.clone()),
                }),
            }
        }
        for (name, old) in &self.fields {
            if !current.iter().any(|(n, _)| n == name) {
                changes.push(FieldChange {
                    field: name,
                    old: Some(old.clone()),
                    new: None,
                });
            }
        }
        changes
    }

    /// Links added to and removed from one collection since the snapshot.
    pub fn collection_diff(&self, name: &str, current: &[Link]) -> CollectionChange {
        let empty = BTreeSet::new();
        let before = self.collections.get(name).unwrap_or(&empty);
        let now: BTreeSet<Link> = current.iter().copied().collect();
        CollectionChange {
            added: now.difference(before).copied().collect(),
            removed: before.difference(&now).copied().collect(),
        }
    }

    fn rewrite_links(&mut self, rewrite: &impl Fn(Link) -> Link) -> bool {
        let mut changed = false;
        for links in self.collections.values_mut() {
            if links.iter().any(|l| rewrite(*l) != *l) {
                *links = links.iter().map(|l| rewrite(*l)).collect();
                changed = true;
            }
        }
        changed
    }
}

/// One changed field: `(old, new)` values, `None` when absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Added and removed links of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChange {
    pub added: Vec<Link>,
    pub removed: Vec<Link>,
}

impl CollectionChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Snapshots of every tracked entry that has a baseline.
#[derive(Debug, Default, Clone)]
pub struct SnapshotStore {
    snapshots: HashMap<EntryId, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record current values as the baseline for `entry`.
    #[tracing::instrument(level = "trace", skip(self, fields, collections))]
    pub fn capture(
        &mut self,
        entry: EntryId,
        fields: Vec<(&'static str, Value)>,
        collections: Vec<(&'static str, Vec<Link>)>,
    ) {
        tracing::trace!(
            entry = %entry,
            fields = fields.len(),
            collections = collections.len(),
            "Taking entry snapshot"
        );
        self.snapshots.insert(entry, Snapshot::new(fields, collections));
    }

    /// Replace only the collection part of a baseline, keeping field values.
    pub fn capture_collections(&mut self, entry: EntryId, collections: Vec<(&'static str, Vec<Link>)>) {
        match self.snapshots.get_mut(&entry) {
            Some(snapshot) => {
                snapshot.collections = collections
                    .into_iter()
                    .map(|(name, links)| (name, links.into_iter().collect()))
                    .collect();
            }
            None => {
                self.snapshots
                    .insert(entry, Snapshot::collections_only(collections));
            }
        }
    }

    /// Set the baseline of one collection, keeping everything else.
    pub fn set_collection(&mut self, entry: EntryId, name: &'static str, links: Vec<Link>) {
        let snapshot = self
            .snapshots
            .entry(entry)
            .or_insert_with(|| Snapshot::collections_only(Vec::new()));
        snapshot.collections.insert(name, links.into_iter().collect());
    }

    pub fn insert(&mut self, entry: EntryId, snapshot: Snapshot) {
        self.snapshots.insert(entry, snapshot);
    }

    pub fn get(&self, entry: EntryId) -> Option<&Snapshot> {
        self.snapshots.get(&entry)
    }

    pub fn contains(&self, entry: EntryId) -> bool {
        self.snapshots.contains_key(&entry)
    }

    pub fn remove(&mut self, entry: EntryId) -> Option<Snapshot> {
        self.snapshots.remove(&entry)
    }

    /// Changed fields of `entry`, or `None` without a baseline.
    pub fn diff(&self, entry: EntryId, current: &[(&'static str, Value)]) -> Option<Vec<FieldChange>> {
        self.snapshots.get(&entry).map(|s| s.diff(current))
    }

    /// Whether `entry` differs from its baseline; entries without one are dirty.
    pub fn is_dirty(&self, entry: EntryId, current: &[(&'static str, Value)]) -> bool {
        self.diff(entry, current).is_none_or(|changes| !changes.is_empty())
    }

    /// Apply a link rewrite to every stored collection.
    pub fn rewrite_links(&mut self, rewrite: impl Fn(Link) -> Link) -> usize {
        self.snapshots
            .values_mut()
            .filter_map(|s| s.rewrite_links(&rewrite).then_some(()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}
