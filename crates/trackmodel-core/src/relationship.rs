//! Relationship metadata and relationship fields.
//!
//! Relationships are declared as static metadata on each [`Entity`]. The
//! fields themselves never own related entities: a [`Related`] holds one
//! [`Link`] and a [`RelatedMany`] holds a set of them, so object graphs with
//! back references stay acyclic in memory.

use crate::entity::{Entity, EntityRef, Link};
use crate::row::Row;
use crate::value::Value;
use crate::Result;
use std::fmt;
use std::marker::PhantomData;

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many availabilities belong to one vendor.
    #[default]
    ManyToOne,
    /// One-to-many: one vendor has many availabilities.
    OneToMany,
    /// Many-to-many: bricks have many tags through a junction relation.
    ManyToMany,
}

/// Junction relation realizing a many-to-many relationship.
///
/// `left_column` holds the key of the owning side, `right_column` the key of
/// the inverse side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionInfo {
    pub table: &'static str,
    pub left_column: &'static str,
    pub right_column: &'static str,
}

impl JunctionInfo {
    #[must_use]
    pub const fn new(
        table: &'static str,
        left_column: &'static str,
        right_column: &'static str,
    ) -> Self {
        Self {
            table,
            left_column,
            right_column,
        }
    }
}

/// Metadata about a relationship between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship field.
    pub name: &'static str,

    /// The related entity's name.
    pub related_entity: &'static str,

    pub kind: RelationshipKind,

    /// Foreign key column: on this entity for ManyToOne, on the related
    /// entity for OneToMany.
    pub foreign_key: Option<&'static str>,

    /// Junction relation for ManyToMany.
    pub junction: Option<JunctionInfo>,

    /// ManyToMany side whose key is stored in the junction's right column.
    pub inverse: bool,

    /// The field on the related entity that points back.
    pub back_populates: Option<&'static str>,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(
        name: &'static str,
        related_entity: &'static str,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            name,
            related_entity,
            kind,
            foreign_key: None,
            junction: None,
            inverse: false,
            back_populates: None,
        }
    }

    /// A reference to a parent, stored in `foreign_key` on this entity.
    #[must_use]
    pub const fn many_to_one(
        name: &'static str,
        related_entity: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::new(name, related_entity, RelationshipKind::ManyToOne).foreign_key(foreign_key)
    }

    /// Children of this entity, found through `foreign_key` on the child.
    #[must_use]
    pub const fn one_to_many(
        name: &'static str,
        related_entity: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::new(name, related_entity, RelationshipKind::OneToMany).foreign_key(foreign_key)
    }

    /// Owning side of a many-to-many relationship.
    #[must_use]
    pub const fn many_to_many(
        name: &'static str,
        related_entity: &'static str,
        junction: JunctionInfo,
    ) -> Self {
        Self::new(name, related_entity, RelationshipKind::ManyToMany).junction(junction)
    }

    #[must_use]
    pub const fn foreign_key(mut self, column: &'static str) -> Self {
        self.foreign_key = Some(column);
        self
    }

    #[must_use]
    pub const fn junction(mut self, junction: JunctionInfo) -> Self {
        self.junction = Some(junction);
        self
    }

    /// Mark this many-to-many side as the inverse (right) side.
    #[must_use]
    pub const fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    #[must_use]
    pub const fn back_populates(mut self, field: &'static str) -> Self {
        self.back_populates = Some(field);
        self
    }

    /// Junction column holding this side's key.
    pub fn own_junction_column(&self) -> Option<&'static str> {
        self.junction
            .map(|j| if self.inverse { j.right_column } else { j.left_column })
    }

    /// Junction column holding the related side's key.
    pub fn other_junction_column(&self) -> Option<&'static str> {
        self.junction
            .map(|j| if self.inverse { j.left_column } else { j.right_column })
    }

    /// Orient an (own, other) key pair as (left, right) junction columns.
    pub fn orient<K>(&self, own: K, other: K) -> (K, K) {
        if self.inverse { (other, own) } else { (own, other) }
    }
}

// ============================================================================
// Relationship Lookup Helpers
// ============================================================================

/// Find a relationship by field name on an entity.
pub fn find_relationship<E: Entity>(name: &str) -> Option<&'static RelationshipInfo> {
    E::RELATIONSHIPS.iter().find(|r| r.name == name)
}

// ============================================================================
// Relationship Fields
// ============================================================================

/// Many-to-one relationship field.
///
/// Holds the parent's key once known; while the parent is only tracked (not
/// yet inserted) it holds the parent's entry link and the foreign key column
/// reads as NULL until the flush assigns it.
pub struct Related<T> {
    link: Option<Link>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Related<T> {
    pub const fn empty() -> Self {
        Self {
            link: None,
            _marker: PhantomData,
        }
    }

    /// Point at a tracked parent.
    pub fn to(parent: &EntityRef<T>) -> Self {
        Self::from_link(Some(Link::from(parent)))
    }

    /// Point at a persisted parent by key.
    pub const fn key(key: i64) -> Self {
        Self {
            link: Some(Link::Key(key)),
            _marker: PhantomData,
        }
    }

    pub const fn from_link(link: Option<Link>) -> Self {
        Self {
            link,
            _marker: PhantomData,
        }
    }

    /// Read the foreign key column of a row.
    #[allow(clippy::result_large_err)]
    pub fn from_column(row: &Row, column: &str) -> Result<Self> {
        let key: Option<i64> = row.get_named(column)?;
        Ok(Self::from_link(key.map(Link::Key)))
    }

    pub fn link(&self) -> Option<Link> {
        self.link
    }

    pub fn set(&mut self, parent: &EntityRef<T>) {
        self.link = Some(Link::from(parent));
    }

    pub fn set_link(&mut self, link: Option<Link>) {
        self.link = link;
    }

    pub fn clear(&mut self) {
        self.link = None;
    }

    pub fn is_empty(&self) -> bool {
        self.link.is_none()
    }

    /// The parent's key, when it is known.
    pub fn foreign_key(&self) -> Option<i64> {
        self.link.and_then(Link::key)
    }

    /// Value of the foreign key column.
    pub fn fk_value(&self) -> Value {
        Value::from(self.foreign_key())
    }
}

impl<T> Clone for Related<T> {
    fn clone(&self) -> Self {
        Self {
            link: self.link,
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Default for Related<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> PartialEq for Related<T> {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link
    }
}

impl<T> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Related").field(&self.link).finish()
    }
}

/// Many-to-many collection field.
///
/// The collection is the in-memory view of the junction rows owned by this
/// entity; it is only meaningful for the store after an explicit load or
/// after the entity's own flushes.
pub struct RelatedMany<T> {
    links: Vec<Link>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> RelatedMany<T> {
    pub const fn new() -> Self {
        Self {
            links: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn from_links(links: Vec<Link>) -> Self {
        let mut many = Self::new();
        for link in links {
            many.insert(link);
        }
        many
    }

    /// Add a tracked entity; returns false if it was already present.
    pub fn link(&mut self, other: &EntityRef<T>) -> bool {
        self.insert(Link::from(other))
    }

    /// Add a persisted entity by key.
    pub fn link_key(&mut self, key: i64) -> bool {
        self.insert(Link::Key(key))
    }

    pub fn insert(&mut self, link: Link) -> bool {
        if self.links.contains(&link) {
            return false;
        }
        self.links.push(link);
        true
    }

    pub fn unlink(&mut self, other: &EntityRef<T>) -> bool {
        self.remove(Link::from(other))
    }

    pub fn unlink_key(&mut self, key: i64) -> bool {
        self.remove(Link::Key(key))
    }

    pub fn remove(&mut self, link: Link) -> bool {
        let before = self.links.len();
        self.links.retain(|l| *l != link);
        self.links.len() != before
    }

    pub fn contains(&self, link: Link) -> bool {
        self.links.contains(&link)
    }

    pub fn contains_key(&self, key: i64) -> bool {
        self.contains(Link::Key(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.links.iter().filter_map(|l| l.key())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn to_vec(&self) -> Vec<Link> {
        self.links.clone()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }
}

impl<T> Clone for RelatedMany<T> {
    fn clone(&self) -> Self {
        Self {
            links: self.links.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Default for RelatedMany<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PartialEq for RelatedMany<T> {
    fn eq(&self, other: &Self) -> bool {
        self.links == other.links
    }
}

impl<T> fmt::Debug for RelatedMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.links).finish()
    }
}
