//! The `Entity` trait and the handles used to refer to tracked entities.

use crate::Result;
use crate::constraint::FieldConstraint;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ENTRY: AtomicU64 = AtomicU64::new(1);

/// Identity of a tracked entry.
///
/// Entry ids are unique for the life of the process, so a handle issued by
/// one session never names an entry of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Allocate a fresh entry id.
    pub fn next() -> Self {
        Self(NEXT_ENTRY.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#e{}", self.0)
    }
}

/// Persistence state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked (never added, or purged after a delete was flushed).
    Detached,
    /// Scheduled for insertion.
    Added,
    /// Matches its snapshot.
    Unchanged,
    /// Differs from its snapshot.
    Modified,
    /// Scheduled for deletion.
    Deleted,
}

impl EntityState {
    /// Added, Unchanged or Modified.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Unchanged | EntityState::Modified
        )
    }

    /// Whether a flush has work to do for this state.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Detached => "Detached",
            EntityState::Added => "Added",
            EntityState::Unchanged => "Unchanged",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed handle to a tracked entity.
pub struct EntityRef<E> {
    id: EntryId,
    _marker: PhantomData<fn() -> E>,
}

impl<E> EntityRef<E> {
    pub const fn new(id: EntryId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub const fn id(&self) -> EntryId {
        self.id
    }
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EntityRef<E> {}

impl<E> PartialEq for EntityRef<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for EntityRef<E> {}

impl<E> Hash for EntityRef<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<E> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef<{}>({})", std::any::type_name::<E>(), self.id)
    }
}

/// A relationship target: either a persisted key or a tracked entry that
/// has not received one yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Link {
    Key(i64),
    Entry(EntryId),
}

impl Link {
    pub const fn key(self) -> Option<i64> {
        match self {
            Link::Key(key) => Some(key),
            Link::Entry(_) => None,
        }
    }

    pub const fn entry(self) -> Option<EntryId> {
        match self {
            Link::Entry(id) => Some(id),
            Link::Key(_) => None,
        }
    }
}

impl<E> From<EntityRef<E>> for Link {
    fn from(handle: EntityRef<E>) -> Self {
        Link::Entry(handle.id())
    }
}

impl<E> From<&EntityRef<E>> for Link {
    fn from(handle: &EntityRef<E>) -> Self {
        Link::Entry(handle.id())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Key(key) => write!(f, "{}", key),
            Link::Entry(id) => write!(f, "{}", id),
        }
    }
}

/// A record that can be tracked and persisted.
///
/// Scalar fields travel as `(column, Value)` pairs; relationship fields are
/// exposed by name so the tracker can resolve foreign keys and junction rows
/// without knowing the concrete type.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct Vendor {
///     id: Option<i64>,
///     vendor_name: String,
/// }
///
/// impl Entity for Vendor {
///     const ENTITY_NAME: &'static str = "vendors";
///
///     fn key(&self) -> Option<i64> { self.id }
///     fn set_key(&mut self, key: i64) { self.id = Some(key) }
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("vendor_name", self.vendor_name.clone().into())]
///     }
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self { id: row.get_named("id")?, vendor_name: row.get_named("vendor_name")? })
///     }
/// }
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    /// Name of the relation this entity is stored in.
    const ENTITY_NAME: &'static str;

    /// Primary key column.
    const PRIMARY_KEY: &'static str = "id";

    /// Relationship metadata for this entity.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Field constraints checked before the entity is written.
    const CONSTRAINTS: &'static [FieldConstraint] = &[];

    /// Current primary key, `None` until persisted or assigned.
    fn key(&self) -> Option<i64>;

    /// Set the primary key (called after the store assigns one).
    fn set_key(&mut self, key: i64);

    /// Scalar fields, including foreign-key columns, excluding the primary key.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a store row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Many-to-one relationship fields by relationship name.
    fn references(&self) -> Vec<(&'static str, Option<Link>)> {
        Vec::new()
    }

    /// Replace a many-to-one relationship target.
    fn set_reference(&mut self, _relationship: &str, _link: Option<Link>) {}

    /// Many-to-many collections by relationship name.
    fn collections(&self) -> Vec<(&'static str, Vec<Link>)> {
        Vec::new()
    }

    /// Replace the contents of a many-to-many collection.
    fn set_collection(&mut self, _relationship: &str, _links: Vec<Link>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ids_are_unique() {
        let a = EntryId::next();
        let b = EntryId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_link_accessors() {
        let id = EntryId::next();
        assert_eq!(Link::Key(7).key(), Some(7));
        assert_eq!(Link::Key(7).entry(), None);
        assert_eq!(Link::Entry(id).entry(), Some(id));

        let handle: EntityRef<()> = EntityRef::new(id);
        assert_eq!(Link::from(&handle), Link::Entry(id));
    }

    #[test]
    fn test_state_flags() {
        assert!(EntityState::Added.is_live());
        assert!(!EntityState::Deleted.is_live());
        assert!(EntityState::Deleted.is_pending());
        assert!(!EntityState::Unchanged.is_pending());
        assert_eq!(EntityState::Modified.to_string(), "Modified");
    }
}
