//! Change tracking for tracked entities.
//!
//! The [`ChangeTracker`] owns every tracked entity of a session in an arena
//! keyed by [`EntryId`] (ids are allocated in increasing order, so the arena
//! iterates in tracking order), together with the [`IdentityMap`] and the
//! [`SnapshotStore`]. Entities are stored type-erased so that one tracker
//! can hold any mix of entity types; typed access goes through
//! [`EntityRef`] handles.
//!
//! State transitions:
//!
//! ```text
//! add            Detached  -> Added
//! attach         Detached  -> Unchanged | Modified
//! detect_changes Unchanged -> Modified
//! remove         Unchanged | Modified -> Deleted, Added -> Detached
//! flush          Added | Modified -> Unchanged, Deleted -> Detached
//! ```

use crate::flush::FlushPlan;
use crate::identity_map::IdentityMap;
use crate::resolver::{self, JunctionAction};
use crate::snapshot::{CollectionChange, FieldChange, Snapshot, SnapshotStore};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use trackmodel_core::{
    BatchResult, Entity, EntityRef, EntityState, EntryId, Error, FieldConstraint, KeyRef, Link,
    Operation, RelationshipInfo, RelationshipKind, Result, Value, find_relationship,
};

// ============================================================================
// Type Erasure
// ============================================================================

/// Object-safe view of an [`Entity`].
pub(crate) trait ErasedEntity: Send + Sync {
    fn name(&self) -> &'static str;
    fn pk_column(&self) -> &'static str;
    fn relationship_info(&self) -> &'static [RelationshipInfo];
    fn constraint_list(&self) -> &'static [FieldConstraint];
    fn current_key(&self) -> Option<i64>;
    fn assign_key(&mut self, key: i64);
    fn row(&self) -> Vec<(&'static str, Value)>;
    fn reference_links(&self) -> Vec<(&'static str, Option<Link>)>;
    fn replace_reference(&mut self, relationship: &str, link: Option<Link>);
    fn collection_links(&self) -> Vec<(&'static str, Vec<Link>)>;
    fn replace_collection(&mut self, relationship: &str, links: Vec<Link>);
    fn clone_box(&self) -> Box<dyn ErasedEntity>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: Entity> ErasedEntity for E {
    fn name(&self) -> &'static str {
        E::ENTITY_NAME
    }

    fn pk_column(&self) -> &'static str {
        E::PRIMARY_KEY
    }

    fn relationship_info(&self) -> &'static [RelationshipInfo] {
        E::RELATIONSHIPS
    }

    fn constraint_list(&self) -> &'static [FieldConstraint] {
        E::CONSTRAINTS
    }

    fn current_key(&self) -> Option<i64> {
        self.key()
    }

    fn assign_key(&mut self, key: i64) {
        self.set_key(key);
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        self.to_row()
    }

    fn reference_links(&self) -> Vec<(&'static str, Option<Link>)> {
        self.references()
    }

    fn replace_reference(&mut self, relationship: &str, link: Option<Link>) {
        self.set_reference(relationship, link);
    }

    fn collection_links(&self) -> Vec<(&'static str, Vec<Link>)> {
        self.collections()
    }

    fn replace_collection(&mut self, relationship: &str, links: Vec<Link>) {
        self.set_collection(relationship, links);
    }

    fn clone_box(&self) -> Box<dyn ErasedEntity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Tracked Objects
// ============================================================================

/// A tracked entity together with its state.
pub struct TrackedObject {
    pub(crate) entity: Box<dyn ErasedEntity>,
    pub(crate) state: EntityState,
    /// Key the entry is registered under in the identity map.
    pub(crate) indexed_key: Option<i64>,
}

impl TrackedObject {
    pub fn entity_name(&self) -> &'static str {
        self.entity.name()
    }

    pub fn key_column(&self) -> &'static str {
        self.entity.pk_column()
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// The key as currently set on the entity.
    pub fn key(&self) -> Option<i64> {
        self.entity.current_key()
    }

    pub fn indexed_key(&self) -> Option<i64> {
        self.indexed_key
    }

    pub fn row(&self) -> Vec<(&'static str, Value)> {
        self.entity.row()
    }

    pub fn references(&self) -> Vec<(&'static str, Option<Link>)> {
        self.entity.reference_links()
    }

    pub fn collections(&self) -> Vec<(&'static str, Vec<Link>)> {
        self.entity.collection_links()
    }

    pub fn collection(&self, name: &str) -> Vec<Link> {
        self.collections()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, links)| links)
            .unwrap_or_default()
    }

    pub fn relationships(&self) -> &'static [RelationshipInfo] {
        self.entity.relationship_info()
    }

    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships().iter().find(|r| r.name == name)
    }

    pub fn constraints(&self) -> &'static [FieldConstraint] {
        self.entity.constraint_list()
    }

    /// Junction endpoint for this entry.
    pub(crate) fn key_ref(&self, id: EntryId) -> KeyRef {
        self.indexed_key.map_or(KeyRef::Pending(id), KeyRef::Key)
    }
}

impl Clone for TrackedObject {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity.clone_box(),
            state: self.state,
            indexed_key: self.indexed_key,
        }
    }
}

impl fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedObject")
            .field("entity", &self.entity_name())
            .field("state", &self.state)
            .field("key", &self.indexed_key)
            .finish()
    }
}

/// Public view of one tracked entry.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub id: EntryId,
    pub entity: &'static str,
    pub key: Option<i64>,
    pub state: EntityState,
    /// Values last synchronized with the store; absent for Added and Detached.
    pub snapshot: Option<Snapshot>,
}

/// Number of tracked entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub added: usize,
    pub unchanged: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.added + self.unchanged + self.modified + self.deleted
    }

    /// Entries a flush has work for.
    pub fn pending(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// Pre-flush copies of the entries touched by flushes inside a transaction.
///
/// Only the first copy of an entry is kept, so restoring brings every entry
/// back to its state before the first journaled flush.
#[derive(Debug, Default)]
pub struct TrackerSavepoint {
    entries: BTreeMap<EntryId, (TrackedObject, Option<Snapshot>)>,
}

impl TrackerSavepoint {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Change Tracker
// ============================================================================

/// Arena of tracked entities with identity and snapshot bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct ChangeTracker {
    objects: BTreeMap<EntryId, TrackedObject>,
    identity: IdentityMap,
    snapshots: SnapshotStore,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a new entity for insertion.
    ///
    /// Fails with [`Error::AlreadyTracked`] if the entity carries a key that a
    /// live entry already owns, or [`Error::DuplicateKey`] if the owner is
    /// scheduled for deletion.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn add<E: Entity>(&mut self, entity: E) -> Result<EntityRef<E>> {
        self.insert_object(entity, EntityState::Added, None)
    }

    /// Track several new entities; on failure none of them stays tracked.
    pub fn add_range<E: Entity>(
        &mut self,
        entities: impl IntoIterator<Item = E>,
    ) -> Result<Vec<EntityRef<E>>> {
        let mut handles = Vec::new();
        for entity in entities {
            match self.add(entity) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        self.detach(handle.id());
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Track an entity that already exists in the store.
    ///
    /// With `as_modified` the entity starts Modified without a field
    /// baseline, so the next flush writes every field.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn attach<E: Entity>(&mut self, entity: E, as_modified: bool) -> Result<EntityRef<E>> {
        if entity.key().is_none() {
            return Err(Error::MissingKey {
                entity: E::ENTITY_NAME,
            });
        }
        let collections = entity.collections();
        let (state, snapshot) = if as_modified {
            (EntityState::Modified, Snapshot::collections_only(collections))
        } else {
            (
                EntityState::Unchanged,
                Snapshot::new(entity.to_row(), collections),
            )
        };
        self.insert_object(entity, state, Some(snapshot))
    }

    /// Track an entity read from the store; an entry already tracked under
    /// the same key wins and its handle is returned instead.
    pub fn track_loaded<E: Entity>(&mut self, entity: E) -> Result<EntityRef<E>> {
        let key = entity.key().ok_or(Error::MissingKey {
            entity: E::ENTITY_NAME,
        })?;
        if let Some(existing) = self.identity.lookup(E::ENTITY_NAME, key) {
            tracing::trace!(
                entity = E::ENTITY_NAME,
                key,
                entry = %existing,
                "Loaded row resolved to tracked entry"
            );
            return Ok(EntityRef::new(existing));
        }
        self.attach(entity, false)
    }

    fn insert_object<E: Entity>(
        &mut self,
        entity: E,
        state: EntityState,
        snapshot: Option<Snapshot>,
    ) -> Result<EntityRef<E>> {
        let key = entity.key();
        if let Some(key) = key {
            self.check_identity(E::ENTITY_NAME, key, None)?;
        }

        let id = EntryId::next();
        if let Some(key) = key {
            self.identity.register(E::ENTITY_NAME, key, id)?;
        }
        if let Some(snapshot) = snapshot {
            self.snapshots.insert(id, snapshot);
        }
        self.objects.insert(
            id,
            TrackedObject {
                entity: Box::new(entity),
                state,
                indexed_key: key,
            },
        );

        tracing::trace!(
            entity = E::ENTITY_NAME,
            key,
            entry = %id,
            state = %state,
            "Tracking entity"
        );
        Ok(EntityRef::new(id))
    }

    fn check_identity(&self, entity: &'static str, key: i64, claimant: Option<EntryId>) -> Result<()> {
        match self.identity.lookup(entity, key) {
            Some(existing) if Some(existing) == claimant => Ok(()),
            Some(existing) => {
                let state = self
                    .objects
                    .get(&existing)
                    .map_or(EntityState::Detached, |o| o.state);
                if state == EntityState::Deleted {
                    Err(Error::DuplicateKey { entity, key })
                } else {
                    Err(Error::AlreadyTracked {
                        entity,
                        key: Some(key),
                        state,
                    })
                }
            }
            None => Ok(()),
        }
    }

    /// Schedule an entity for deletion.
    ///
    /// An Added entity is dropped from the tracker instead; removing a
    /// Deleted entity again does nothing.
    #[tracing::instrument(level = "debug", skip(self, handle), fields(entity = E::ENTITY_NAME, entry = %handle.id()))]
    pub fn remove<E: Entity>(&mut self, handle: &EntityRef<E>) -> Result<()> {
        let id = handle.id();
        let Some(object) = self.objects.get_mut(&id) else {
            return Err(Error::NotTracked {
                entity: E::ENTITY_NAME,
                entry: id,
            });
        };

        match object.state {
            EntityState::Added => {
                self.detach(id);
            }
            EntityState::Unchanged | EntityState::Modified => {
                tracing::trace!(from = %object.state, "Entity scheduled for deletion");
                object.state = EntityState::Deleted;
            }
            EntityState::Deleted | EntityState::Detached => {}
        }
        Ok(())
    }

    /// Drop an entry from the tracker entirely.
    pub(crate) fn detach(&mut self, id: EntryId) -> Option<TrackedObject> {
        let object = self.objects.remove(&id)?;
        if let Some(key) = object.indexed_key {
            self.identity.forget(object.entity_name(), key);
        }
        self.snapshots.remove(id);
        tracing::trace!(entity = object.entity_name(), entry = %id, "Entry detached");
        Some(object)
    }

    /// Stop tracking every entity.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.identity.clear();
        self.snapshots.clear();
    }

    // ========================================================================
    // Access
    // ========================================================================

    pub fn get<E: Entity>(&self, handle: &EntityRef<E>) -> Option<&E> {
        self.objects.get(&handle.id())?.entity.as_any().downcast_ref()
    }

    /// Mutable access; mutations are picked up by [`detect_changes`](Self::detect_changes).
    pub fn get_mut<E: Entity>(&mut self, handle: &EntityRef<E>) -> Option<&mut E> {
        self.objects
            .get_mut(&handle.id())?
            .entity
            .as_any_mut()
            .downcast_mut()
    }

    /// Handle of the entry tracked under `key`.
    pub fn lookup<E: Entity>(&self, key: i64) -> Option<EntityRef<E>> {
        self.identity.lookup(E::ENTITY_NAME, key).map(EntityRef::new)
    }

    pub fn state<E>(&self, handle: &EntityRef<E>) -> EntityState {
        self.objects
            .get(&handle.id())
            .map_or(EntityState::Detached, |o| o.state)
    }

    /// The entry behind `handle`, or a Detached placeholder.
    pub fn entry_for<E: Entity>(&self, handle: &EntityRef<E>) -> TrackedEntry {
        self.entry(handle.id()).unwrap_or(TrackedEntry {
            id: handle.id(),
            entity: E::ENTITY_NAME,
            key: None,
            state: EntityState::Detached,
            snapshot: None,
        })
    }

    fn entry(&self, id: EntryId) -> Option<TrackedEntry> {
        self.objects.get(&id).map(|object| TrackedEntry {
            id,
            entity: object.entity_name(),
            key: object.key(),
            state: object.state,
            snapshot: match object.state {
                EntityState::Added | EntityState::Detached => None,
                _ => self.snapshots.get(id).cloned(),
            },
        })
    }

    /// Every tracked entry in tracking order.
    pub fn entries(&self) -> Vec<TrackedEntry> {
        self.objects.keys().filter_map(|id| self.entry(*id)).collect()
    }

    /// Fields of the entity that differ from its snapshot.
    ///
    /// Without a baseline every field is reported with no old value.
    pub fn changes<E: Entity>(&self, handle: &EntityRef<E>) -> Result<Vec<FieldChange>> {
        let id = handle.id();
        let object = self.objects.get(&id).ok_or(Error::NotTracked {
            entity: E::ENTITY_NAME,
            entry: id,
        })?;
        let row = object.row();
        Ok(self.snapshots.diff(id, &row).unwrap_or_else(|| {
            row.into_iter()
                .map(|(field, value)| FieldChange {
                    field,
                    old: None,
                    new: Some(value),
                })
                .collect()
        }))
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for object in self.objects.values() {
            match object.state {
                EntityState::Added => counts.added += 1,
                EntityState::Unchanged => counts.unchanged += 1,
                EntityState::Modified => counts.modified += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Detached => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = (EntryId, &TrackedObject)> {
        self.objects.iter().map(|(id, object)| (*id, object))
    }

    pub(crate) fn objects_mut(&mut self) -> impl Iterator<Item = (EntryId, &mut TrackedObject)> {
        self.objects.iter_mut().map(|(id, object)| (*id, object))
    }

    pub(crate) fn object(&self, id: EntryId) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub(crate) fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub(crate) fn snapshots_mut(&mut self) -> &mut SnapshotStore {
        &mut self.snapshots
    }

    // ========================================================================
    // Change Detection
    // ========================================================================

    /// Mark every Unchanged entity that differs from its snapshot as Modified.
    ///
    /// Returns how many entries changed state. Running it twice without
    /// further mutation changes nothing the second time. Fails with
    /// [`Error::KeyChanged`] if the key of a persisted entity was changed in
    /// place; in that case no state is changed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<usize> {
        resolver::normalize_links(self);

        let mut reindex = Vec::new();
        let mut claimed = HashSet::new();
        let mut modified = Vec::new();

        for (&id, object) in &self.objects {
            let entity = object.entity_name();
            let current = object.key();
            match object.state {
                EntityState::Added => {
                    if current == object.indexed_key {
                        continue;
                    }
                    if let Some(key) = current {
                        self.check_identity(entity, key, Some(id))?;
                        if !claimed.insert((entity, key)) {
                            return Err(Error::AlreadyTracked {
                                entity,
                                key: Some(key),
                                state: EntityState::Added,
                            });
                        }
                    }
                    reindex.push((id, current));
                }
                EntityState::Unchanged | EntityState::Modified | EntityState::Deleted => {
                    if let Some(from) = object.indexed_key {
                        if current != Some(from) {
                            return Err(Error::KeyChanged {
                                entity,
                                from,
                                to: current,
                            });
                        }
                    }
                    if object.state == EntityState::Unchanged && self.is_dirty(id, object) {
                        modified.push(id);
                    }
                }
                EntityState::Detached => {}
            }
        }

        for (id, key) in reindex {
            let Some(object) = self.objects.get_mut(&id) else {
                continue;
            };
            let entity = object.entity_name();
            if let Some(old) = object.indexed_key.take() {
                self.identity.forget(entity, old);
            }
            if let Some(key) = key {
                self.identity.register(entity, key, id)?;
                object.indexed_key = Some(key);
            }
            tracing::trace!(entity, key, entry = %id, "Added entry re-keyed");
        }

        for id in &modified {
            if let Some(object) = self.objects.get_mut(id) {
                tracing::trace!(entity = object.entity_name(), entry = %id, "Entity modified");
                object.state = EntityState::Modified;
            }
        }

        tracing::debug!(modified = modified.len(), "Change detection complete");
        Ok(modified.len())
    }

    /// A reference still pointing at an unkeyed entry is a pending foreign
    /// key write even when the scalar columns match the snapshot.
    fn is_dirty(&self, id: EntryId, object: &TrackedObject) -> bool {
        self.snapshots.is_dirty(id, &object.row())
            || object
                .references()
                .iter()
                .any(|(_, link)| matches!(link, Some(Link::Entry(_))))
    }

    // ========================================================================
    // Explicit Loading
    // ========================================================================

    /// Merge the links the store holds for a many-to-many collection.
    ///
    /// The collection snapshot becomes `stored`; pending in-memory additions
    /// and removals are kept on top of it. Returns the merged collection.
    pub fn merge_collection<E: Entity>(
        &mut self,
        handle: &EntityRef<E>,
        relationship: &str,
        stored: Vec<Link>,
    ) -> Result<Vec<Link>> {
        let id = handle.id();
        let rel = find_relationship::<E>(relationship)
            .filter(|r| r.kind == RelationshipKind::ManyToMany)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "{} has no many-to-many relationship '{}'",
                    E::ENTITY_NAME,
                    relationship
                ))
            })?;
        let object = self.objects.get_mut(&id).ok_or(Error::NotTracked {
            entity: E::ENTITY_NAME,
            entry: id,
        })?;

        let current = object.collection(rel.name);
        let pending = match self.snapshots.get(id) {
            Some(snapshot) => snapshot.collection_diff(rel.name, &current),
            None => CollectionChange {
                added: current,
                removed: Vec::new(),
            },
        };

        let mut merged: Vec<Link> = stored
            .iter()
            .copied()
            .filter(|link| !pending.removed.contains(link))
            .collect();
        for link in pending.added {
            if !merged.contains(&link) {
                merged.push(link);
            }
        }

        object.entity.replace_collection(rel.name, merged.clone());
        self.snapshots.set_collection(id, rel.name, stored);
        Ok(merged)
    }

    // ========================================================================
    // Post-Flush Promotion
    // ========================================================================

    /// Promote the tracker after the store committed `plan`.
    ///
    /// Assigns store keys, marks Added and Modified entries Unchanged, purges
    /// Deleted entries, rewrites temporary links to keys, mirrors junction
    /// changes into both sides' collections and refreshes snapshots. A key
    /// the identity map cannot accept is reported once everything else has
    /// been promoted.
    #[tracing::instrument(level = "debug", skip_all, fields(operations = plan.operations.len()))]
    pub fn accept_changes(&mut self, plan: &FlushPlan, result: &BatchResult) -> Result<()> {
        let mut failure = None;

        for op in &plan.operations {
            let &Operation::Insert {
                entry, entity, key, ..
            } = op
            else {
                continue;
            };
            let Some(object) = self.objects.get_mut(&entry) else {
                continue;
            };
            let Some(assigned) = key.or_else(|| result.keys.get(&entry).copied()) else {
                tracing::warn!(entity, entry = %entry, "Store reported no key for inserted entity");
                failure.get_or_insert(Error::MissingKey { entity });
                continue;
            };

            object.entity.assign_key(assigned);
            if object.indexed_key == Some(assigned) {
                continue;
            }
            match self.identity.register(entity, assigned, entry) {
                Ok(()) => object.indexed_key = Some(assigned),
                Err(e) => {
                    tracing::warn!(entity, key = assigned, "Assigned key collides with a tracked entry");
                    failure.get_or_insert(e);
                }
            }
        }

        for id in &plan.touched {
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            match object.state {
                EntityState::Added | EntityState::Modified => {
                    object.state = EntityState::Unchanged;
                }
                EntityState::Deleted => {
                    self.detach(*id);
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }

        resolver::normalize_links(self);

        for change in &plan.junctions {
            let (Some(left), Some(right)) = (self.resolve_key(change.left), self.resolve_key(change.right))
            else {
                continue;
            };
            let table = change.junction.table;
            self.sync_junction_side(change.left_entity, left, table, false, right, change.action);
            self.sync_junction_side(change.right_entity, right, table, true, left, change.action);
        }

        let touched: HashSet<EntryId> = plan.touched.iter().copied().collect();
        for (&id, object) in &self.objects {
            if touched.contains(&id) {
                self.snapshots.capture(id, object.row(), object.collections());
            } else if object.state != EntityState::Added {
                self.snapshots.capture_collections(id, object.collections());
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resolve_key(&self, key: KeyRef) -> Option<i64> {
        match key {
            KeyRef::Key(key) => Some(key),
            KeyRef::Pending(id) => self.objects.get(&id)?.indexed_key,
        }
    }

    fn sync_junction_side(
        &mut self,
        entity: &'static str,
        key: i64,
        table: &'static str,
        inverse: bool,
        other: i64,
        action: JunctionAction,
    ) {
        let Some(id) = self.identity.lookup(entity, key) else {
            return;
        };
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        let link = Link::Key(other);
        let sides = object.relationships().iter().filter(|r| {
            r.kind == RelationshipKind::ManyToMany
                && r.inverse == inverse
                && r.junction.is_some_and(|j| j.table == table)
        });
        for rel in sides {
            let mut links = object.collection(rel.name);
            let changed = match action {
                JunctionAction::Insert if !links.contains(&link) => {
                    links.push(link);
                    true
                }
                JunctionAction::Delete if links.contains(&link) => {
                    links.retain(|l| *l != link);
                    true
                }
                _ => false,
            };
            if changed {
                object.entity.replace_collection(rel.name, links);
            }
        }
    }

    // ========================================================================
    // Transaction Journal
    // ========================================================================

    /// Record the pre-flush copies of every entry `plan` is about to change.
    pub fn journal(&self, savepoint: &mut TrackerSavepoint, plan: &FlushPlan) {
        let endpoints = plan
            .junctions
            .iter()
            .flat_map(|c| [(c.left_entity, c.left), (c.right_entity, c.right)])
            .filter_map(|(entity, key)| match key {
                KeyRef::Pending(id) => Some(id),
                KeyRef::Key(key) => self.identity.lookup(entity, key),
            });

        for id in plan.touched.iter().copied().chain(endpoints) {
            if savepoint.entries.contains_key(&id) {
                continue;
            }
            if let Some(object) = self.objects.get(&id) {
                savepoint
                    .entries
                    .insert(id, (object.clone(), self.snapshots.get(id).cloned()));
            }
        }
    }

    /// Put journaled entries back into their pre-flush state.
    #[tracing::instrument(level = "debug", skip_all, fields(entries = savepoint.len()))]
    pub fn restore(&mut self, savepoint: TrackerSavepoint) -> usize {
        let restored = savepoint.entries.len();
        // Keys handed out by the rolled-back flushes.
        let revoked: HashMap<(&'static str, i64), EntryId> = savepoint
            .entries
            .iter()
            .filter_map(|(&id, (before, _))| {
                let key = self.objects.get(&id)?.indexed_key?;
                (before.indexed_key != Some(key)).then_some(((before.entity_name(), key), id))
            })
            .collect();

        for (id, (object, snapshot)) in savepoint.entries {
            self.objects.insert(id, object);
            match snapshot {
                Some(snapshot) => self.snapshots.insert(id, snapshot),
                None => {
                    self.snapshots.remove(id);
                }
            }
        }

        self.identity.clear();
        for (&id, object) in &self.objects {
            if let Some(key) = object.indexed_key {
                if let Err(e) = self.identity.register(object.entity_name(), key, id) {
                    tracing::warn!(error = %e, entry = %id, "Restored entry lost its identity mapping");
                }
            }
        }
        if !revoked.is_empty() {
            self.relink_revoked(&revoked);
        }
        restored
    }

    /// Point links that carry a revoked key back at the entry that owned it.
    fn relink_revoked(&mut self, revoked: &HashMap<(&'static str, i64), EntryId>) {
        let relink = |rel: Option<&'static RelationshipInfo>, link: Link| match (rel, link) {
            (Some(rel), Link::Key(key)) => revoked
                .get(&(rel.related_entity, key))
                .map_or(link, |id| Link::Entry(*id)),
            _ => link,
        };

        let mut relinked = 0;
        for object in self.objects.values_mut() {
            for (name, link) in object.references() {
                let Some(link) = link else {
                    continue;
                };
                let restored = relink(object.relationship(name), link);
                if restored != link {
                    object.entity.replace_reference(name, Some(restored));
                    relinked += 1;
                }
            }
            for (name, links) in object.collections() {
                let rel = object.relationship(name);
                if links.iter().any(|l| relink(rel, *l) != *l) {
                    object
                        .entity
                        .replace_collection(name, links.into_iter().map(|l| relink(rel, l)).collect());
                    relinked += 1;
                }
            }
        }
        tracing::trace!(revoked = revoked.len(), relinked, "Relinked rolled-back keys");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackmodel_core::{Related, Row};

    #[derive(Debug, Clone, PartialEq)]
    struct Vendor {
        id: Option<i64>,
        vendor_name: String,
    }

    impl Entity for Vendor {
        const ENTITY_NAME: &'static str = "vendors";

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("vendor_name", Value::from(self.vendor_name.as_str()))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                vendor_name: row.get_named("vendor_name")?,
            })
        }
    }

    #[derive(Debug, Clone)]
    struct Availability {
        id: Option<i64>,
        vendor: Related<Vendor>,
        price: String,
    }

    impl Entity for Availability {
        const ENTITY_NAME: &'static str = "availabilities";
        const RELATIONSHIPS: &'static [RelationshipInfo] =
            &[RelationshipInfo::many_to_one("vendor", "vendors", "vendor_id")];

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("vendor_id", self.vendor.fk_value()),
                ("price", Value::decimal(self.price.as_str())),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                vendor: Related::from_column(row, "vendor_id")?,
                price: row.get_named("price")?,
            })
        }

        fn references(&self) -> Vec<(&'static str, Option<Link>)> {
            vec![("vendor", self.vendor.link())]
        }

        fn set_reference(&mut self, relationship: &str, link: Option<Link>) {
            if relationship == "vendor" {
                self.vendor.set_link(link);
            }
        }
    }

    fn vendor(id: Option<i64>, name: &str) -> Vendor {
        Vendor {
            id,
            vendor_name: name.to_string(),
        }
    }

    #[test]
    fn test_add_tracks_as_added() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.add(vendor(None, "Brick Shack")).unwrap();

        assert_eq!(tracker.state(&handle), EntityState::Added);
        let entry = tracker.entry_for(&handle);
        assert_eq!(entry.entity, "vendors");
        assert!(entry.snapshot.is_none());
        assert_eq!(tracker.get(&handle).unwrap().vendor_name, "Brick Shack");
    }

    #[test]
    fn test_add_then_attach_same_key_fails() {
        let mut tracker = ChangeTracker::new();
        tracker.add(vendor(Some(1), "Brick Shack")).unwrap();

        let err = tracker.attach(vendor(Some(1), "Brick Shack"), false).unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyTracked {
                entity: "vendors",
                key: Some(1),
                state: EntityState::Added
            }
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_add_over_deleted_key_is_duplicate() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.attach(vendor(Some(1), "Brick Shack"), false).unwrap();
        tracker.remove(&handle).unwrap();

        let err = tracker.add(vendor(Some(1), "Brick Shack")).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { entity: "vendors", key: 1 }));
    }

    #[test]
    fn test_attach_requires_key() {
        let mut tracker = ChangeTracker::new();
        let err = tracker.attach(vendor(None, "Brick Shack"), false).unwrap_err();
        assert!(matches!(err, Error::MissingKey { entity: "vendors" }));
    }

    #[test]
    fn test_attach_as_modified_has_no_field_baseline() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.attach(vendor(Some(3), "Brick Shack"), true).unwrap();

        assert_eq!(tracker.state(&handle), EntityState::Modified);
        let changes = tracker.changes(&handle).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, None);
    }

    #[test]
    fn test_remove_transitions() {
        let mut tracker = ChangeTracker::new();
        let added = tracker.add(vendor(None, "New")).unwrap();
        let persisted = tracker.attach(vendor(Some(2), "Old"), false).unwrap();

        tracker.remove(&added).unwrap();
        assert_eq!(tracker.state(&added), EntityState::Detached);
        assert!(tracker.get(&added).is_none());

        tracker.remove(&persisted).unwrap();
        assert_eq!(tracker.state(&persisted), EntityState::Deleted);
        tracker.remove(&persisted).unwrap();
        assert_eq!(tracker.state(&persisted), EntityState::Deleted);

        let err = tracker.remove(&added).unwrap_err();
        assert!(matches!(err, Error::NotTracked { .. }));
    }

    #[test]
    fn test_detect_changes_is_idempotent() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.attach(vendor(Some(1), "Brick Shack"), false).unwrap();
        assert_eq!(tracker.detect_changes().unwrap(), 0);

        tracker.get_mut(&handle).unwrap().vendor_name = "Brick Palace".to_string();
        assert_eq!(tracker.detect_changes().unwrap(), 1);
        assert_eq!(tracker.state(&handle), EntityState::Modified);
        assert_eq!(tracker.detect_changes().unwrap(), 0);
        assert_eq!(tracker.state(&handle), EntityState::Modified);
    }

    #[test]
    fn test_key_change_is_rejected() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.attach(vendor(Some(1), "Brick Shack"), false).unwrap();
        tracker.get_mut(&handle).unwrap().id = Some(9);

        let err = tracker.detect_changes().unwrap_err();
        assert!(matches!(
            err,
            Error::KeyChanged {
                from: 1,
                to: Some(9),
                ..
            }
        ));
        assert_eq!(tracker.state(&handle), EntityState::Unchanged);
    }

    #[test]
    fn test_added_entry_is_rekeyed() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.add(vendor(None, "Brick Shack")).unwrap();
        tracker.get_mut(&handle).unwrap().id = Some(40);

        tracker.detect_changes().unwrap();
        assert_eq!(tracker.lookup::<Vendor>(40), Some(handle));
    }

    #[test]
    fn test_add_range_rolls_back() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(vendor(Some(2), "Existing"), false).unwrap();

        let err = tracker
            .add_range(vec![vendor(None, "A"), vendor(Some(2), "B")])
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyTracked { .. }));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_track_loaded_prefers_tracked_instance() {
        let mut tracker = ChangeTracker::new();
        let handle = tracker.attach(vendor(Some(5), "In memory"), false).unwrap();
        tracker.get_mut(&handle).unwrap().vendor_name = "Edited".to_string();

        let loaded = tracker.track_loaded(vendor(Some(5), "From store")).unwrap();
        assert_eq!(loaded, handle);
        assert_eq!(tracker.get(&loaded).unwrap().vendor_name, "Edited");
    }

    #[test]
    fn test_pending_reference_marks_modified() {
        let mut tracker = ChangeTracker::new();
        let parent = tracker.add(vendor(None, "New vendor")).unwrap();
        let child = tracker
            .attach(
                Availability {
                    id: Some(1),
                    vendor: Related::empty(),
                    price: "1.50".to_string(),
                },
                false,
            )
            .unwrap();

        tracker.get_mut(&child).unwrap().vendor.set(&parent);
        assert_eq!(tracker.detect_changes().unwrap(), 1);
        assert_eq!(tracker.state(&child), EntityState::Modified);
    }

    /// Plan, journal and accept one flush the way a session inside a
    /// transaction does.
    fn flush_in_transaction(
        tracker: &mut ChangeTracker,
        savepoint: &mut TrackerSavepoint,
        keys: &[(EntryId, i64)],
    ) {
        tracker.detect_changes().unwrap();
        let resolution = resolver::resolve(tracker).unwrap();
        let plan = crate::flush::plan(tracker, &resolution, true).unwrap();
        tracker.journal(savepoint, &plan);
        let result = BatchResult {
            keys: keys.iter().copied().collect(),
            rows_affected: 0,
        };
        tracker.accept_changes(&plan, &result).unwrap();
    }

    #[test]
    fn test_restore_relinks_keys_handed_out_in_the_transaction() {
        let mut tracker = ChangeTracker::new();
        let mut savepoint = TrackerSavepoint::default();
        let parent = tracker.add(vendor(None, "Brick Shack")).unwrap();
        flush_in_transaction(&mut tracker, &mut savepoint, &[(parent.id(), 1)]);

        let child = tracker
            .add(Availability {
                id: None,
                vendor: Related::to(&parent),
                price: "6.50".to_string(),
            })
            .unwrap();
        flush_in_transaction(&mut tracker, &mut savepoint, &[(child.id(), 1)]);
        assert_eq!(tracker.get(&child).unwrap().vendor.link(), Some(Link::Key(1)));

        assert_eq!(tracker.restore(savepoint), 2);
        assert_eq!(tracker.state(&parent), EntityState::Added);
        assert_eq!(tracker.get(&parent).unwrap().id, None);
        assert!(tracker.lookup::<Vendor>(1).is_none());
        assert_eq!(
            tracker.get(&child).unwrap().vendor.link(),
            Some(Link::Entry(parent.id()))
        );
    }

    #[test]
    fn test_state_counts() {
        let mut tracker = ChangeTracker::new();
        tracker.add(vendor(None, "A")).unwrap();
        let b = tracker.attach(vendor(Some(1), "B"), false).unwrap();
        tracker.attach(vendor(Some(2), "C"), true).unwrap();
        tracker.remove(&b).unwrap();

        let counts = tracker.state_counts();
        assert_eq!(
            counts,
            StateCounts {
                added: 1,
                unchanged: 0,
                modified: 1,
                deleted: 1
            }
        );
        assert_eq!(counts.pending(), 3);
        assert_eq!(tracker.entries().len(), 3);
    }
}
