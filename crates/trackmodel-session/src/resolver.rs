//! Relationship resolution.
//!
//! Before a flush is planned the resolver:
//!
//! 1. rewrites temporary links (`Link::Entry`) to keys where the target
//!    already has one ([`normalize_links`]);
//! 2. walks the object graph from every pending entry and checks that each
//!    temporary link names a live tracked entry;
//! 3. records which foreign key columns must be filled with a key the store
//!    assigns during the same batch, and the insert/delete dependencies
//!    between pending entries;
//! 4. computes the junction rows to insert and delete for many-to-many
//!    collections, comparing both sides against their snapshots.

use crate::change_tracker::{ChangeTracker, TrackedObject};
use crate::snapshot::CollectionChange;
use std::collections::{BTreeMap, HashMap, HashSet};
use trackmodel_core::{
    EntityState, EntryId, Error, JunctionInfo, KeyRef, Link, RelationshipKind, Result,
};

/// Whether a junction row is created or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JunctionAction {
    Insert,
    Delete,
}

/// One junction row to write, oriented as (left, right) columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionChange {
    pub action: JunctionAction,
    pub junction: JunctionInfo,
    pub left: KeyRef,
    pub right: KeyRef,
    /// Entity whose key is stored in the left column.
    pub left_entity: &'static str,
    pub right_entity: &'static str,
}

/// Output of [`resolve`].
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    /// Foreign key columns per entry that wait for a parent's assigned key.
    pub pending_keys: HashMap<EntryId, Vec<(&'static str, EntryId)>>,
    /// Added entry -> Added parents it references.
    pub insert_dependencies: BTreeMap<EntryId, Vec<EntryId>>,
    /// Deleted entry -> Deleted parents it references.
    pub delete_dependencies: BTreeMap<EntryId, Vec<EntryId>>,
    pub junctions: Vec<JunctionChange>,
    /// Entries visited by the reachability walk.
    pub reachable: usize,
}

impl Resolution {
    pub fn pending_keys_for(&self, entry: EntryId) -> &[(&'static str, EntryId)] {
        self.pending_keys.get(&entry).map_or(&[], Vec::as_slice)
    }
}

/// Rewrite every `Link::Entry` whose target has a key into `Link::Key`.
///
/// Covers reference fields, collections and collection snapshots. Returns
/// the number of rewritten fields.
pub fn normalize_links(tracker: &mut ChangeTracker) -> usize {
    let keyed: HashMap<EntryId, i64> = tracker
        .objects()
        .filter_map(|(id, object)| object.indexed_key().map(|key| (id, key)))
        .collect();
    if keyed.is_empty() {
        return 0;
    }

    let rewrite = |link: Link| match link {
        Link::Entry(id) => keyed.get(&id).map_or(link, |key| Link::Key(*key)),
        Link::Key(_) => link,
    };

    let mut rewritten = 0;
    for (_, object) in tracker.objects_mut() {
        for (name, link) in object.references() {
            let Some(link) = link else {
                continue;
            };
            let normalized = rewrite(link);
            if normalized != link {
                object.entity.replace_reference(name, Some(normalized));
                rewritten += 1;
            }
        }
        for (name, links) in object.collections() {
            if links.iter().any(|l| rewrite(*l) != *l) {
                object
                    .entity
                    .replace_collection(name, links.into_iter().map(rewrite).collect());
                rewritten += 1;
            }
        }
    }
    rewritten += tracker.snapshots_mut().rewrite_links(rewrite);

    if rewritten > 0 {
        tracing::trace!(rewritten, "Normalized temporary links");
    }
    rewritten
}

/// Resolve relationships of every pending entry.
#[tracing::instrument(level = "debug", skip(tracker))]
pub fn resolve(tracker: &ChangeTracker) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    let mut worklist: Vec<EntryId> = tracker
        .objects()
        .filter(|(id, object)| object.state().is_pending() || has_collection_changes(tracker, *id, object))
        .map(|(id, _)| id)
        .collect();
    worklist.reverse();
    let mut visited = HashSet::new();

    while let Some(id) = worklist.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(object) = tracker.object(id) else {
            continue;
        };
        let deleted = object.state() == EntityState::Deleted;

        for (name, link) in object.references() {
            let (Some(link), Some(rel)) = (link, object.relationship(name)) else {
                continue;
            };
            let target = match link {
                Link::Entry(target) => Some(target),
                Link::Key(key) => tracker.identity().lookup(rel.related_entity, key),
            };
            // A key outside the tracker names a row that only the store knows.
            let Some(target) = target else {
                continue;
            };
            let target_state = tracker
                .object(target)
                .map_or(EntityState::Detached, TrackedObject::state);

            if deleted {
                if target_state == EntityState::Deleted {
                    resolution
                        .delete_dependencies
                        .entry(id)
                        .or_default()
                        .push(target);
                }
                continue;
            }

            if !target_state.is_live() {
                tracing::debug!(
                    entity = object.entity_name(),
                    relationship = rel.name,
                    target = %target,
                    target_state = %target_state,
                    "Unresolved parent"
                );
                return Err(Error::UnresolvedParent {
                    entity: object.entity_name(),
                    relationship: rel.name,
                    target,
                });
            }

            if target_state == EntityState::Added {
                if object.state() == EntityState::Added {
                    resolution
                        .insert_dependencies
                        .entry(id)
                        .or_default()
                        .push(target);
                }
                if let (Link::Entry(_), Some(column)) = (link, rel.foreign_key) {
                    resolution
                        .pending_keys
                        .entry(id)
                        .or_default()
                        .push((column, target));
                }
            }
            worklist.push(target);
        }

        if deleted {
            continue;
        }
        for (name, links) in object.collections() {
            for link in links {
                let Link::Entry(target) = link else {
                    continue;
                };
                let live = tracker
                    .object(target)
                    .is_some_and(|o| o.state().is_live());
                if !live {
                    return Err(Error::UnresolvedParent {
                        entity: object.entity_name(),
                        relationship: name,
                        target,
                    });
                }
                worklist.push(target);
            }
        }
    }

    resolution.reachable = visited.len();
    resolution.junctions = junction_changes(tracker)?;

    tracing::debug!(
        reachable = resolution.reachable,
        pending_keys = resolution.pending_keys.len(),
        junctions = resolution.junctions.len(),
        "Relationships resolved"
    );
    Ok(resolution)
}

fn has_collection_changes(tracker: &ChangeTracker, id: EntryId, object: &TrackedObject) -> bool {
    let snapshot = tracker.snapshots().get(id);
    object.collections().into_iter().any(|(name, links)| match snapshot {
        Some(snapshot) => !snapshot.collection_diff(name, &links).is_empty(),
        None => !links.is_empty(),
    })
}

struct PairVotes {
    junction: JunctionInfo,
    left_entity: &'static str,
    right_entity: &'static str,
    owner: Option<JunctionAction>,
    inverse: Option<JunctionAction>,
}

/// Junction rows to write, one per logical pair change.
///
/// Each side votes for the pairs its collection added or removed since its
/// snapshot; the owning side's vote wins. A pair is inserted only if no
/// snapshot knows it yet and deleted only if one does, so a change made on
/// both sides yields a single operation.
fn junction_changes(tracker: &ChangeTracker) -> Result<Vec<JunctionChange>> {
    let mut votes: BTreeMap<(&'static str, KeyRef, KeyRef), PairVotes> = BTreeMap::new();
    let mut known: HashSet<(&'static str, KeyRef, KeyRef)> = HashSet::new();

    for (id, object) in tracker.objects() {
        let deleted = object.state() == EntityState::Deleted;
        let snapshot = tracker.snapshots().get(id);
        let own = object.key_ref(id);

        for rel in object.relationships() {
            let (RelationshipKind::ManyToMany, Some(junction)) = (rel.kind, rel.junction) else {
                continue;
            };
            let (left_entity, right_entity) = rel.orient(object.entity_name(), rel.related_entity);

            if let Some(links) = snapshot.and_then(|s| s.collection(rel.name)) {
                for link in links {
                    if let Some(other) = endpoint(tracker, *link) {
                        let (left, right) = rel.orient(own, other);
                        known.insert((junction.table, left, right));
                    }
                }
            }

            let current = if deleted {
                Vec::new()
            } else {
                object.collection(rel.name)
            };
            let change = match snapshot {
                Some(snapshot) => snapshot.collection_diff(rel.name, &current),
                None => CollectionChange {
                    added: current,
                    removed: Vec::new(),
                },
            };

            for (links, action) in [
                (change.added, JunctionAction::Insert),
                (change.removed, JunctionAction::Delete),
            ] {
                for link in links {
                    let Some(other) = endpoint(tracker, link) else {
                        return Err(Error::UnresolvedParent {
                            entity: object.entity_name(),
                            relationship: rel.name,
                            target: link.entry().unwrap_or(id),
                        });
                    };
                    let (left, right) = rel.orient(own, other);
                    let slot = votes
                        .entry((junction.table, left, right))
                        .or_insert(PairVotes {
                            junction,
                            left_entity,
                            right_entity,
                            owner: None,
                            inverse: None,
                        });
                    let vote = if rel.inverse {
                        &mut slot.inverse
                    } else {
                        &mut slot.owner
                    };
                    vote.get_or_insert(action);
                }
            }
        }
    }

    Ok(votes
        .into_iter()
        .filter_map(|((table, left, right), pair)| {
            let action = pair.owner.or(pair.inverse)?;
            let is_known = known.contains(&(table, left, right));
            match (action, is_known) {
                (JunctionAction::Insert, false) | (JunctionAction::Delete, true) => {
                    Some(JunctionChange {
                        action,
                        junction: pair.junction,
                        left,
                        right,
                        left_entity: pair.left_entity,
                        right_entity: pair.right_entity,
                    })
                }
                _ => None,
            }
        })
        .collect())
}

/// Junction endpoint for a collection link; `None` for a temporary link to
/// an entry that is not live.
fn endpoint(tracker: &ChangeTracker, link: Link) -> Option<KeyRef> {
    match link {
        Link::Key(key) => Some(KeyRef::Key(key)),
        Link::Entry(target) => tracker
            .object(target)
            .filter(|o| o.state().is_live())
            .map(|o| o.key_ref(target)),
    }
}
