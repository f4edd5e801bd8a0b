//! Reconciliation planning.
//!
//! Turns the tracker's pending state into one ordered batch:
//!
//! - INSERT parent-first (dependency order among Added entries)
//! - UPDATE in tracking order, changed columns only
//! - junction INSERTs, then junction DELETEs
//! - DELETE child-first
//!
//! Planning is pure: it reads the tracker and a [`Resolution`] and never
//! changes either.

use crate::change_tracker::ChangeTracker;
use crate::resolver::{JunctionAction, JunctionChange, Resolution};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use trackmodel_core::{
    EntityState, EntryId, Error, KeyRef, Operation, Result, Value, validate_row,
};

/// An ordered reconciliation batch and what it covers.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    pub operations: Vec<Operation>,
    /// Entries whose state the flush changes.
    pub touched: Vec<EntryId>,
    pub junctions: Vec<JunctionChange>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.touched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Operation counts by kind.
    pub fn summary(&self) -> FlushResult {
        let mut result = FlushResult::new();
        for op in &self.operations {
            match op {
                Operation::Insert { .. } => result.inserted += 1,
                Operation::Update { .. } => result.updated += 1,
                Operation::Delete { .. } => result.deleted += 1,
                Operation::JunctionInsert { .. } => result.junction_inserted += 1,
                Operation::JunctionDelete { .. } => result.junction_deleted += 1,
            }
        }
        result
    }
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    pub junction_inserted: usize,
    pub junction_deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.junction_inserted + self.junction_deleted
    }
}

/// Build the batch for the tracker's pending changes.
///
/// Fails with [`Error::DependencyCycle`] when Added entities reference each
/// other in a cycle, and with [`Error::Validation`] when `validate` is set
/// and a written row violates its entity's field constraints.
#[tracing::instrument(level = "debug", skip_all)]
pub fn plan(tracker: &ChangeTracker, resolution: &Resolution, validate: bool) -> Result<FlushPlan> {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();
    for (id, object) in tracker.objects() {
        match object.state() {
            EntityState::Added => added.push(id),
            EntityState::Modified => modified.push(id),
            EntityState::Deleted => deleted.push(id),
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }

    let mut plan = FlushPlan::default();

    // Inserts, parents first.
    let (insert_order, cycle) = dependency_order(&added, &resolution.insert_dependencies);
    if let Some(cycle) = cycle {
        let entities = cycle
            .iter()
            .map(|id| {
                let name = tracker.object(*id).map_or("?", |o| o.entity_name());
                format!("{}{}", name, id)
            })
            .collect();
        return Err(Error::DependencyCycle { entities });
    }
    for id in insert_order {
        let Some(object) = tracker.object(id) else {
            continue;
        };
        let pending_keys = resolution.pending_keys_for(id).to_vec();
        let values = object.row();
        if validate {
            check_constraints(object.entity_name(), &values, &pending_keys, object.constraints())?;
        }
        plan.operations.push(Operation::Insert {
            entry: id,
            entity: object.entity_name(),
            key_column: object.key_column(),
            key: object.key(),
            values,
            pending_keys,
        });
    }

    // Updates with the changed columns only.
    for &id in &modified {
        let Some(object) = tracker.object(id) else {
            continue;
        };
        let key = object.indexed_key().ok_or(Error::MissingKey {
            entity: object.entity_name(),
        })?;
        let row = object.row();
        let pending_keys = resolution.pending_keys_for(id).to_vec();

        let mut changes: Vec<(&'static str, Value)> = tracker
            .snapshots()
            .diff(id, &row)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|change| change.new.map(|value| (change.field, value)))
            .collect();
        for (column, _) in &pending_keys {
            if !changes.iter().any(|(field, _)| field == column) {
                changes.push((*column, Value::Null));
            }
        }
        if changes.is_empty() {
            tracing::trace!(entity = object.entity_name(), key, "Modified entity has no changed columns");
            continue;
        }
        if validate {
            check_constraints(object.entity_name(), &row, &pending_keys, object.constraints())?;
        }
        plan.operations.push(Operation::Update {
            entry: id,
            entity: object.entity_name(),
            key_column: object.key_column(),
            key,
            changes,
            pending_keys,
        });
    }

    // Junction rows: inserts, then deletes.
    for change in &resolution.junctions {
        if change.action == JunctionAction::Insert {
            plan.operations.push(Operation::JunctionInsert {
                junction: change.junction,
                left: change.left,
                right: change.right,
            });
        }
    }
    for change in &resolution.junctions {
        if change.action != JunctionAction::Delete {
            continue;
        }
        let (KeyRef::Key(left), KeyRef::Key(right)) = (change.left, change.right) else {
            return Err(Error::MissingKey {
                entity: change.left_entity,
            });
        };
        plan.operations.push(Operation::JunctionDelete {
            junction: change.junction,
            left,
            right,
        });
    }

    // Deletes, children first.
    let (delete_order, cycle) = dependency_order(&deleted, &resolution.delete_dependencies);
    if let Some(cycle) = cycle {
        tracing::warn!(
            entries = cycle.len(),
            "Deleted entities reference each other in a cycle; delete order is arbitrary within it"
        );
    }
    for id in delete_order.into_iter().rev() {
        let Some(object) = tracker.object(id) else {
            continue;
        };
        let key = object.indexed_key().ok_or(Error::MissingKey {
            entity: object.entity_name(),
        })?;
        plan.operations.push(Operation::Delete {
            entry: id,
            entity: object.entity_name(),
            key_column: object.key_column(),
            key,
        });
    }

    plan.touched = added.into_iter().chain(modified).chain(deleted).collect();
    plan.junctions.clone_from(&resolution.junctions);

    let summary = plan.summary();
    tracing::debug!(
        operations = plan.operations.len(),
        inserted = summary.inserted,
        updated = summary.updated,
        deleted = summary.deleted,
        junction_inserted = summary.junction_inserted,
        junction_deleted = summary.junction_deleted,
        "Flush plan built"
    );
    Ok(plan)
}

/// Pending foreign key columns hold a placeholder until the store fills
/// them, so they are left out of the check.
fn check_constraints(
    entity: &'static str,
    row: &[(&'static str, Value)],
    pending_keys: &[(&'static str, EntryId)],
    constraints: &[trackmodel_core::FieldConstraint],
) -> Result<()> {
    if constraints.is_empty() {
        return Ok(());
    }
    // A pending foreign key is filled in by the store.
    let checked: Vec<trackmodel_core::FieldConstraint> = constraints
        .iter()
        .filter(|c| !pending_keys.iter().any(|(column, _)| *column == c.field()))
        .copied()
        .collect();
    validate_row(entity, row, &checked).map_err(Error::Validation)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order `ids` so that every entry comes after the entries it depends on.
///
/// Ties keep the order of `ids`. Dependencies outside `ids` are ignored. A
/// back edge is skipped and the first cycle found is returned alongside the
/// order.
fn dependency_order(
    ids: &[EntryId],
    dependencies: &BTreeMap<EntryId, Vec<EntryId>>,
) -> (Vec<EntryId>, Option<Vec<EntryId>>) {
    struct Walk<'a> {
        dependencies: &'a BTreeMap<EntryId, Vec<EntryId>>,
        members: HashMap<EntryId, Option<Mark>>,
        stack: Vec<EntryId>,
        order: Vec<EntryId>,
        cycle: Option<Vec<EntryId>>,
    }

    impl Walk<'_> {
        fn visit(&mut self, id: EntryId) {
            match self.members.get(&id) {
                Some(None) => {}
                Some(Some(Mark::Done)) | None => return,
                Some(Some(Mark::Visiting)) => {
                    if self.cycle.is_none() {
                        let start = self.stack.iter().position(|e| *e == id).unwrap_or(0);
                        let mut cycle = self.stack[start..].to_vec();
                        cycle.push(id);
                        self.cycle = Some(cycle);
                    }
                    return;
                }
            }

            self.members.insert(id, Some(Mark::Visiting));
            self.stack.push(id);
            let parents = self.dependencies.get(&id).cloned().unwrap_or_default();
            for parent in parents {
                self.visit(parent);
            }
            self.stack.pop();
            self.members.insert(id, Some(Mark::Done));
            self.order.push(id);
        }
    }

    let mut walk = Walk {
        dependencies,
        members: ids.iter().map(|id| (*id, None)).collect(),
        stack: Vec::new(),
        order: Vec::with_capacity(ids.len()),
        cycle: None,
    };
    for id in ids {
        walk.visit(*id);
    }
    (walk.order, walk.cycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{BRICK_TAGS, Brick, Tag, Vendor};
    use crate::resolver::{normalize_links, resolve};
    use trackmodel_core::{
        BatchResult, Entity, FieldConstraint, Link, Related, Row, ValidationErrorKind,
    };

    fn plan_for(tracker: &mut ChangeTracker) -> Result<FlushPlan> {
        tracker.detect_changes()?;
        normalize_links(tracker);
        let resolution = resolve(tracker)?;
        plan(tracker, &resolution, true)
    }

    fn kinds(plan: &FlushPlan) -> Vec<String> {
        plan.operations
            .iter()
            .map(|op| format!("{} {}", op.kind(), op.relation()))
            .collect()
    }

    #[test]
    fn test_parent_inserted_before_child_and_link() {
        let mut tracker = ChangeTracker::new();
        let tag = tracker.add(Tag::new("round")).unwrap();
        let mut brick = Brick::new("Plate");
        brick.tags.link(&tag);
        let brick = tracker.add(brick).unwrap();
        let vendor = tracker.add(Vendor::new("Brick Shack")).unwrap();
        tracker.get_mut(&brick).unwrap().vendor.set(&vendor);

        let plan = plan_for(&mut tracker).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                "insert tags",
                "insert vendors",
                "insert bricks",
                "junction_insert brick_tags",
            ]
        );
        let Operation::Insert { pending_keys, .. } = &plan.operations[2] else {
            panic!("expected insert");
        };
        assert_eq!(pending_keys, &vec![("vendor_id", vendor.id())]);
        assert_eq!(
            plan.operations[3],
            Operation::JunctionInsert {
                junction: BRICK_TAGS,
                left: KeyRef::Pending(brick.id()),
                right: KeyRef::Pending(tag.id()),
            }
        );
    }

    #[test]
    fn test_update_carries_changed_columns_only() {
        let mut tracker = ChangeTracker::new();
        let vendor = tracker
            .attach(
                Vendor {
                    id: Some(2),
                    vendor_name: "Brick Shack".to_string(),
                },
                false,
            )
            .unwrap();
        let mut brick = Brick::new("Plate");
        brick.id = Some(7);
        brick.vendor = Related::key(2);
        let brick = tracker.attach(brick, false).unwrap();

        tracker.get_mut(&brick).unwrap().title = "Round Plate".to_string();
        let plan = plan_for(&mut tracker).unwrap();

        assert_eq!(
            plan.operations,
            vec![Operation::Update {
                entry: brick.id(),
                entity: "bricks",
                key_column: "id",
                key: 7,
                changes: vec![("title", Value::from("Round Plate"))],
                pending_keys: Vec::new(),
            }]
        );
        assert_eq!(plan.touched, vec![brick.id()]);
        assert!(!plan.touched.contains(&vendor.id()));
    }

    #[test]
    fn test_modified_without_changes_emits_nothing() {
        let mut tracker = ChangeTracker::new();
        let vendor = tracker
            .attach(
                Vendor {
                    id: Some(2),
                    vendor_name: "Brick Shack".to_string(),
                },
                false,
            )
            .unwrap();
        tracker.get_mut(&vendor).unwrap().vendor_name = "Brick Palace".to_string();
        tracker.detect_changes().unwrap();
        tracker.get_mut(&vendor).unwrap().vendor_name = "Brick Shack".to_string();

        let plan = plan_for(&mut tracker).unwrap();
        assert!(plan.operations.is_empty());
        assert_eq!(plan.touched, vec![vendor.id()]);
    }

    #[test]
    fn test_deletes_children_first() {
        let mut tracker = ChangeTracker::new();
        let vendor = tracker
            .attach(
                Vendor {
                    id: Some(1),
                    vendor_name: "Brick Shack".to_string(),
                },
                false,
            )
            .unwrap();
        let mut brick = Brick::new("Plate");
        brick.id = Some(5);
        brick.vendor = Related::key(1);
        let brick = tracker.attach(brick, false).unwrap();

        tracker.remove(&vendor).unwrap();
        tracker.remove(&brick).unwrap();

        let plan = plan_for(&mut tracker).unwrap();
        assert_eq!(kinds(&plan), vec!["delete bricks", "delete vendors"]);
    }

    #[derive(Debug, Clone)]
    struct Node {
        id: Option<i64>,
        next: Related<Node>,
    }

    impl Entity for Node {
        const ENTITY_NAME: &'static str = "nodes";
        const RELATIONSHIPS: &'static [trackmodel_core::RelationshipInfo] =
            &[trackmodel_core::RelationshipInfo::many_to_one("next", "nodes", "next_id")];

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("next_id", self.next.fk_value())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                next: Related::from_column(row, "next_id")?,
            })
        }

        fn references(&self) -> Vec<(&'static str, Option<Link>)> {
            vec![("next", self.next.link())]
        }

        fn set_reference(&mut self, _relationship: &str, link: Option<Link>) {
            self.next.set_link(link);
        }
    }

    #[test]
    fn test_insert_cycle_is_rejected() {
        let mut tracker = ChangeTracker::new();
        let a = tracker
            .add(Node {
                id: None,
                next: Related::empty(),
            })
            .unwrap();
        let b = tracker
            .add(Node {
                id: None,
                next: Related::to(&a),
            })
            .unwrap();
        tracker.get_mut(&a).unwrap().next.set(&b);

        let entities = match plan_for(&mut tracker) {
            Err(Error::DependencyCycle { entities }) => entities,
            other => panic!("expected a dependency cycle, got {other:?}"),
        };
        assert_eq!(entities.len(), 3);
        assert!(entities[0].starts_with("nodes#e"));
    }

    #[derive(Debug, Clone)]
    struct Dish {
        id: Option<i64>,
        title: String,
    }

    impl Entity for Dish {
        const ENTITY_NAME: &'static str = "dishes";
        const CONSTRAINTS: &'static [FieldConstraint] =
            &[FieldConstraint::MaxLength {
                field: "title",
                max: 100,
            }];

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("title", Value::from(self.title.as_str()))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                title: row.get_named("title")?,
            })
        }
    }

    #[test]
    fn test_constraints_checked_before_planning() {
        let mut tracker = ChangeTracker::new();
        tracker
            .add(Dish {
                id: None,
                title: "x".repeat(101),
            })
            .unwrap();

        let validation = match plan_for(&mut tracker) {
            Err(Error::Validation(validation)) => validation,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert_eq!(validation.errors[0].kind, ValidationErrorKind::MaxLength);

        let resolution = resolve(&tracker).unwrap();
        assert!(plan(&tracker, &resolution, false).is_ok());
    }

    #[test]
    fn test_accept_changes_promotes_and_syncs_collections() {
        let mut tracker = ChangeTracker::new();
        let tag = tracker
            .attach(
                Tag {
                    id: Some(3),
                    ..Tag::new("round")
                },
                false,
            )
            .unwrap();
        let mut brick = Brick::new("Plate");
        brick.tags.link_key(3);
        let brick = tracker.add(brick).unwrap();

        let plan = plan_for(&mut tracker).unwrap();
        let mut result = BatchResult::default();
        result.keys.insert(brick.id(), 11);
        tracker.accept_changes(&plan, &result).unwrap();

        assert_eq!(tracker.state(&brick), EntityState::Unchanged);
        assert_eq!(tracker.get(&brick).unwrap().id, Some(11));
        assert_eq!(tracker.lookup::<Brick>(11), Some(brick));
        assert!(tracker.get(&tag).unwrap().bricks.contains_key(11));
        assert_eq!(tracker.detect_changes().unwrap(), 0);
        assert!(plan_for(&mut tracker).unwrap().is_empty());
    }

    #[test]
    fn test_restore_brings_back_pending_state() {
        let mut tracker = ChangeTracker::new();
        let vendor = tracker.add(Vendor::new("Brick Shack")).unwrap();

        let plan = plan_for(&mut tracker).unwrap();
        let mut savepoint = crate::change_tracker::TrackerSavepoint::default();
        tracker.journal(&mut savepoint, &plan);
        let mut result = BatchResult::default();
        result.keys.insert(vendor.id(), 1);
        tracker.accept_changes(&plan, &result).unwrap();
        assert_eq!(tracker.state(&vendor), EntityState::Unchanged);

        assert_eq!(tracker.restore(savepoint), 1);
        assert_eq!(tracker.state(&vendor), EntityState::Added);
        assert_eq!(tracker.get(&vendor).unwrap().id, None);
        assert!(tracker.lookup::<Vendor>(1).is_none());
    }

    #[test]
    fn test_flush_result_total() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 1,
            junction_inserted: 3,
            junction_deleted: 0,
        };
        assert_eq!(result.total(), 7);
    }
}
