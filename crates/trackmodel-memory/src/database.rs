//! Tables, foreign keys and junction relations of the in-memory engine.
//!
//! [`MemoryDatabase`] is a cheap, cloneable handle to shared state. The
//! schema is derived from entity metadata: every registered entity gets a
//! table keyed by its primary key column, every many-to-one relationship a
//! foreign key, and every many-to-many relationship a junction relation.
//!
//! Integrity rules:
//!
//! - a non-NULL foreign key must name an existing row of the referenced table
//! - a row still referenced by a foreign key cannot be deleted
//! - deleting a row removes the junction pairs it takes part in
//! - both endpoints of a junction pair must exist, and a pair is stored once

use crate::store::MemoryStore;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use trackmodel_core::{
    Entity, Error, QueryError, QueryErrorKind, RelationshipKind, Result, Row, TransactionHandle,
    Value,
};

// ============================================================================
// Schema
// ============================================================================

/// A foreign key column and the table it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

/// One entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub key_column: String,
    pub foreign_keys: Vec<ForeignKey>,
}

/// A junction relation of key pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JunctionSchema {
    pub table: String,
    pub left_column: String,
    pub right_column: String,
    /// Table the left column references.
    pub left_table: String,
    /// Table the right column references.
    pub right_table: String,
}

/// Every relation the database knows about.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Schema {
    pub tables: BTreeMap<String, TableSchema>,
    pub junctions: BTreeMap<String, JunctionSchema>,
}

impl Schema {
    /// Add the table, foreign keys and junctions declared by `E`.
    pub fn register<E: Entity>(&mut self) {
        let table = self
            .tables
            .entry(E::ENTITY_NAME.to_string())
            .or_insert_with(|| TableSchema {
                name: E::ENTITY_NAME.to_string(),
                key_column: E::PRIMARY_KEY.to_string(),
                foreign_keys: Vec::new(),
            });

        for rel in E::RELATIONSHIPS {
            match rel.kind {
                RelationshipKind::ManyToOne => {
                    let Some(column) = rel.foreign_key else {
                        continue;
                    };
                    if !table.foreign_keys.iter().any(|fk| fk.column == column) {
                        table.foreign_keys.push(ForeignKey {
                            column: column.to_string(),
                            references: rel.related_entity.to_string(),
                        });
                    }
                }
                RelationshipKind::ManyToMany => {
                    let Some(junction) = rel.junction else {
                        continue;
                    };
                    let (left_table, right_table) = rel.orient(E::ENTITY_NAME, rel.related_entity);
                    self.junctions
                        .entry(junction.table.to_string())
                        .or_insert_with(|| JunctionSchema {
                            table: junction.table.to_string(),
                            left_column: junction.left_column.to_string(),
                            right_column: junction.right_column.to_string(),
                            left_table: left_table.to_string(),
                            right_table: right_table.to_string(),
                        });
                }
                // Declared on the child as a many-to-one.
                RelationshipKind::OneToMany => {}
            }
        }
        tracing::debug!(entity = E::ENTITY_NAME, "Registered entity table");
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables.get(name).ok_or_else(|| no_such_relation(name))
    }

    pub fn junction(&self, name: &str) -> Option<&JunctionSchema> {
        self.junctions.get(name)
    }

    pub fn is_relation(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.junctions.contains_key(name)
    }
}

fn no_such_relation(name: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::NotFound,
        format!("no such relation: {}", name),
    ))
}

fn constraint(message: String) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Constraint, message))
}

/// Equality as the engine's lookups see it: numeric values compare across
/// variants and NULL never matches.
pub(crate) fn values_match(a: &Value, b: &Value) -> bool {
    match a.compare(b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => !a.is_null() && a.same_value(b),
    }
}

// ============================================================================
// Data
// ============================================================================

/// A stored row: the key column first, then the written columns.
pub(crate) type StoredRow = Vec<(String, Value)>;

#[derive(Debug, Clone, Default)]
pub(crate) struct TableData {
    pub(crate) rows: BTreeMap<i64, StoredRow>,
    next_key: i64,
}

/// The contents of every relation. Cloned wholesale for atomic batches and
/// transaction savepoints.
#[derive(Debug, Clone, Default)]
pub(crate) struct Data {
    pub(crate) tables: BTreeMap<String, TableData>,
    pub(crate) junctions: BTreeMap<String, BTreeSet<(i64, i64)>>,
}

impl Data {
    fn table_mut(&mut self, name: &str) -> &mut TableData {
        self.tables.entry(name.to_string()).or_default()
    }

    pub(crate) fn contains(&self, table: &str, key: i64) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.rows.contains_key(&key))
    }

    fn check_foreign_keys(&self, schema: &TableSchema, columns: &[(String, Value)]) -> Result<()> {
        for fk in &schema.foreign_keys {
            let Some((_, value)) = columns.iter().find(|(c, _)| *c == fk.column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let exists = value
                .as_i64()
                .is_some_and(|key| self.contains(&fk.references, key));
            if !exists {
                return Err(constraint(format!(
                    "foreign key violation: {}.{} = {} has no row in {}",
                    schema.name, fk.column, value, fk.references
                )));
            }
        }
        Ok(())
    }

    /// Insert a row, generating the key when none is given.
    pub(crate) fn insert(
        &mut self,
        schema: &Schema,
        table: &str,
        key: Option<i64>,
        values: Vec<(String, Value)>,
    ) -> Result<i64> {
        let table_schema = schema.table(table)?;
        self.check_foreign_keys(table_schema, &values)?;

        let data = self.table_mut(table);
        let key = match key {
            Some(key) if data.rows.contains_key(&key) => {
                return Err(constraint(format!(
                    "duplicate key: {}.{} = {}",
                    table, table_schema.key_column, key
                )));
            }
            Some(key) => key,
            None => data.next_key.checked_add(1).ok_or_else(|| {
                constraint(format!("key space of {} is exhausted", table))
            })?,
        };
        data.next_key = data.next_key.max(key);

        let mut row = Vec::with_capacity(values.len() + 1);
        row.push((table_schema.key_column.clone(), Value::BigInt(key)));
        row.extend(
            values
                .into_iter()
                .filter(|(column, _)| *column != table_schema.key_column),
        );
        data.rows.insert(key, row);
        tracing::trace!(table, key, "Row inserted");
        Ok(key)
    }

    /// Overwrite columns of one row; returns the number of rows changed.
    pub(crate) fn update(
        &mut self,
        schema: &Schema,
        table: &str,
        key: i64,
        changes: Vec<(String, Value)>,
    ) -> Result<u64> {
        let table_schema = schema.table(table)?;
        if changes.iter().any(|(c, _)| *c == table_schema.key_column) {
            return Err(constraint(format!(
                "primary key {}.{} cannot be updated",
                table, table_schema.key_column
            )));
        }
        self.check_foreign_keys(table_schema, &changes)?;

        let Some(row) = self.table_mut(table).rows.get_mut(&key) else {
            return Ok(0);
        };
        for (column, value) in changes {
            match row.iter_mut().find(|(c, _)| *c == column) {
                Some(slot) => slot.1 = value,
                None => row.push((column, value)),
            }
        }
        tracing::trace!(table, key, "Row updated");
        Ok(1)
    }

    /// Delete one row; returns the number of rows removed.
    ///
    /// Fails while another row still references it. Junction pairs that
    /// name the row go with it.
    pub(crate) fn delete(&mut self, schema: &Schema, table: &str, key: i64) -> Result<u64> {
        schema.table(table)?;
        if !self.contains(table, key) {
            return Ok(0);
        }

        for referencing in schema.tables.values() {
            for fk in referencing.foreign_keys.iter().filter(|fk| fk.references == table) {
                let Some(rows) = self.tables.get(&referencing.name) else {
                    continue;
                };
                let still_referenced = rows.rows.values().any(|row| {
                    row.iter()
                        .any(|(c, v)| *c == fk.column && v.as_i64() == Some(key))
                });
                if still_referenced {
                    return Err(constraint(format!(
                        "foreign key violation: {} {} is still referenced by {}.{}",
                        table, key, referencing.name, fk.column
                    )));
                }
            }
        }

        for junction in schema.junctions.values() {
            let Some(pairs) = self.junctions.get_mut(&junction.table) else {
                continue;
            };
            let before = pairs.len();
            pairs.retain(|(left, right)| {
                !((junction.left_table == table && *left == key)
                    || (junction.right_table == table && *right == key))
            });
            if pairs.len() != before {
                tracing::trace!(
                    junction = %junction.table,
                    removed = before - pairs.len(),
                    "Junction pairs removed with their endpoint"
                );
            }
        }

        self.table_mut(table).rows.remove(&key);
        tracing::trace!(table, key, "Row deleted");
        Ok(1)
    }

    /// Store a junction pair.
    pub(crate) fn link(&mut self, schema: &Schema, junction: &str, left: i64, right: i64) -> Result<()> {
        let info = schema.junction(junction).ok_or_else(|| no_such_relation(junction))?;
        for (table, key) in [(&info.left_table, left), (&info.right_table, right)] {
            if !self.contains(table, key) {
                return Err(constraint(format!(
                    "foreign key violation: {} pair ({}, {}) names missing {} {}",
                    junction, left, right, table, key
                )));
            }
        }
        let pairs = self.junctions.entry(junction.to_string()).or_default();
        if !pairs.insert((left, right)) {
            return Err(constraint(format!(
                "duplicate junction row: {} ({}, {})",
                junction, left, right
            )));
        }
        tracing::trace!(junction, left, right, "Junction pair inserted");
        Ok(())
    }

    /// Remove a junction pair; returns the number of pairs removed.
    pub(crate) fn unlink(&mut self, schema: &Schema, junction: &str, left: i64, right: i64) -> Result<u64> {
        schema.junction(junction).ok_or_else(|| no_such_relation(junction))?;
        let removed = self
            .junctions
            .get_mut(junction)
            .is_some_and(|pairs| pairs.remove(&(left, right)));
        Ok(u64::from(removed))
    }

    /// Every row of a relation, as `(key, columns)` for tables and as the
    /// two junction columns for junctions.
    pub(crate) fn scan(&self, schema: &Schema, relation: &str) -> Result<Vec<Vec<(String, Value)>>> {
        if let Some(info) = schema.junction(relation) {
            let pairs = self.junctions.get(relation);
            return Ok(pairs
                .into_iter()
                .flatten()
                .map(|(left, right)| {
                    vec![
                        (info.left_column.clone(), Value::BigInt(*left)),
                        (info.right_column.clone(), Value::BigInt(*right)),
                    ]
                })
                .collect());
        }
        schema.table(relation)?;
        Ok(self
            .tables
            .get(relation)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Rows of `relation` whose `column` matches `value`.
    pub(crate) fn select(
        &self,
        schema: &Schema,
        relation: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Row>> {
        Ok(self
            .scan(schema, relation)?
            .into_iter()
            .filter(|row| match filter {
                Some((column, value)) => row
                    .iter()
                    .any(|(c, v)| c == column && values_match(v, value)),
                None => true,
            })
            .map(Row::from_pairs)
            .collect())
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// A transaction open on the database and the data it started from.
#[derive(Debug)]
pub(crate) struct OpenTransaction {
    pub(crate) owner: u64,
    pub(crate) handle: TransactionHandle,
    pub(crate) saved: Data,
}

#[derive(Debug, Default)]
pub(crate) struct DatabaseState {
    pub(crate) schema: Schema,
    pub(crate) data: Data,
    pub(crate) transaction: Option<OpenTransaction>,
    pub(crate) next_transaction: u64,
}

/// An in-memory database shared by any number of [`MemoryStore`]s.
///
/// # Example
///
/// ```ignore
/// let db = MemoryDatabase::new()
///     .register::<Vendor>()
///     .register::<Brick>()
///     .register::<Tag>();
///
/// let session = Session::new(db.store());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
    next_store: Arc<AtomicU64>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the relations of entity `E`.
    #[must_use]
    pub fn register<E: Entity>(self) -> Self {
        self.lock().schema.register::<E>();
        self
    }

    /// A new store over this database, with its own transaction slot.
    pub fn store(&self) -> MemoryStore {
        let id = self.next_store.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        MemoryStore::new(self.clone(), id)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the schema.
    pub fn schema(&self) -> Schema {
        self.lock().schema.clone()
    }

    /// Number of rows (or pairs) in a relation; 0 for unknown relations.
    pub fn row_count(&self, relation: &str) -> usize {
        let state = self.lock();
        match state.schema.junction(relation) {
            Some(_) => state.data.junctions.get(relation).map_or(0, BTreeSet::len),
            None => state.data.tables.get(relation).map_or(0, |t| t.rows.len()),
        }
    }

    /// Every row of a relation.
    pub fn rows(&self, relation: &str) -> Result<Vec<Row>> {
        let state = self.lock();
        state.data.select(&state.schema, relation, None)
    }

    /// The row of `table` stored under `key`.
    pub fn get(&self, table: &str, key: i64) -> Option<Row> {
        let state = self.lock();
        state
            .data
            .tables
            .get(table)?
            .rows
            .get(&key)
            .map(|row| Row::from_pairs(row.clone()))
    }

    /// Pairs stored in a junction relation, in key order.
    pub fn junction_pairs(&self, junction: &str) -> Vec<(i64, i64)> {
        self.lock()
            .data
            .junctions
            .get(junction)
            .map(|pairs| pairs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any store holds an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.lock().transaction.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackmodel_core::{JunctionInfo, Link, Related, RelatedMany, RelationshipInfo};

    const BRICK_TAGS: JunctionInfo = JunctionInfo::new("brick_tags", "brick_id", "tag_id");

    #[derive(Debug, Clone)]
    struct Vendor {
        id: Option<i64>,
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
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    #[derive(Debug, Clone)]
    struct Brick {
        id: Option<i64>,
        vendor: Related<Vendor>,
        tags: RelatedMany<Tag>,
    }

    impl Entity for Brick {
        const ENTITY_NAME: &'static str = "bricks";
        const RELATIONSHIPS: &'static [RelationshipInfo] = &[
            RelationshipInfo::many_to_one("vendor", "vendors", "vendor_id"),
            RelationshipInfo::many_to_many("tags", "tags", BRICK_TAGS),
        ];

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("vendor_id", self.vendor.fk_value())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                vendor: Related::from_column(row, "vendor_id")?,
                tags: RelatedMany::new(),
            })
        }

        fn collections(&self) -> Vec<(&'static str, Vec<Link>)> {
            vec![("tags", self.tags.to_vec())]
        }
    }

    #[derive(Debug, Clone)]
    struct Tag {
        id: Option<i64>,
    }

    impl Entity for Tag {
        const ENTITY_NAME: &'static str = "tags";
        const RELATIONSHIPS: &'static [RelationshipInfo] =
            &[RelationshipInfo::many_to_many("bricks", "bricks", BRICK_TAGS).inverse()];

        fn key(&self) -> Option<i64> {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = Some(key);
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    fn schema() -> Schema {
        let mut schema = Schema::default();
        schema.register::<Vendor>();
        schema.register::<Brick>();
        schema.register::<Tag>();
        schema
    }

    fn cols(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(c, v)| ((*c).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_register_derives_relations() {
        let schema = schema();
        assert_eq!(
            schema.table("bricks").unwrap().foreign_keys,
            vec![ForeignKey {
                column: "vendor_id".to_string(),
                references: "vendors".to_string(),
            }]
        );
        let junction = schema.junction("brick_tags").unwrap();
        assert_eq!(junction.left_table, "bricks");
        assert_eq!(junction.right_table, "tags");
        assert_eq!(schema.junctions.len(), 1);
        assert!(schema.is_relation("tags"));
        assert!(!schema.is_relation("orders"));

        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["junctions"]["brick_tags"]["left_column"], "brick_id");
        assert_eq!(json["tables"]["vendors"]["key_column"], "id");
    }

    #[test]
    fn test_insert_generates_keys_after_explicit_ones() {
        let schema = schema();
        let mut data = Data::default();
        assert_eq!(data.insert(&schema, "vendors", None, Vec::new()).unwrap(), 1);
        assert_eq!(data.insert(&schema, "vendors", Some(10), Vec::new()).unwrap(), 10);
        assert_eq!(data.insert(&schema, "vendors", None, Vec::new()).unwrap(), 11);

        let err = data.insert(&schema, "vendors", Some(10), Vec::new()).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Constraint));
    }

    #[test]
    fn test_generated_key_past_the_maximum_is_an_error() {
        let schema = schema();
        let mut data = Data::default();
        assert_eq!(
            data.insert(&schema, "vendors", Some(i64::MAX), Vec::new()).unwrap(),
            i64::MAX
        );

        let err = data.insert(&schema, "vendors", None, Vec::new()).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Constraint));
        assert_eq!(data.tables["vendors"].rows.len(), 1);
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let schema = schema();
        let mut data = Data::default();
        let err = data
            .insert(&schema, "bricks", None, cols(&[("vendor_id", Value::BigInt(4))]))
            .unwrap_err();
        assert!(err.to_string().contains("foreign key violation"));

        let vendor = data.insert(&schema, "vendors", None, Vec::new()).unwrap();
        let brick = data
            .insert(&schema, "bricks", None, cols(&[("vendor_id", Value::BigInt(vendor))]))
            .unwrap();
        data.insert(&schema, "bricks", None, cols(&[("vendor_id", Value::Null)]))
            .unwrap();

        let err = data.delete(&schema, "vendors", vendor).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Constraint));

        assert_eq!(data.delete(&schema, "bricks", brick).unwrap(), 1);
        assert_eq!(data.delete(&schema, "vendors", vendor).unwrap(), 1);
        assert_eq!(data.delete(&schema, "vendors", vendor).unwrap(), 0);
    }

    #[test]
    fn test_junction_pairs_follow_their_endpoints() {
        let schema = schema();
        let mut data = Data::default();
        let brick = data.insert(&schema, "bricks", None, Vec::new()).unwrap();
        let tag = data.insert(&schema, "tags", None, Vec::new()).unwrap();

        assert!(data.link(&schema, "brick_tags", brick, 99).is_err());
        data.link(&schema, "brick_tags", brick, tag).unwrap();
        assert!(data.link(&schema, "brick_tags", brick, tag).is_err());

        let rows = data
            .select(&schema, "brick_tags", Some(("tag_id", &Value::Int(1))))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("brick_id"), Some(&Value::BigInt(brick)));

        data.delete(&schema, "tags", tag).unwrap();
        assert!(data.junctions["brick_tags"].is_empty());
        assert_eq!(data.unlink(&schema, "brick_tags", brick, tag).unwrap(), 0);
    }

    #[test]
    fn test_update_keeps_key_column() {
        let schema = schema();
        let mut data = Data::default();
        let key = data.insert(&schema, "vendors", None, cols(&[("vendor_name", Value::from("A"))])).unwrap();

        assert_eq!(
            data.update(&schema, "vendors", key, cols(&[("vendor_name", Value::from("B"))]))
                .unwrap(),
            1
        );
        assert_eq!(data.update(&schema, "vendors", 42, Vec::new()).unwrap(), 0);
        assert!(data.update(&schema, "vendors", key, cols(&[("id", Value::BigInt(5))])).is_err());

        let rows = data.select(&schema, "vendors", None).unwrap();
        assert_eq!(rows[0].get_by_name("vendor_name"), Some(&Value::from("B")));
    }

    #[test]
    fn test_unknown_relation_is_not_found() {
        let schema = schema();
        let data = Data::default();
        let err = data.select(&schema, "orders", None).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::NotFound));
    }

    #[test]
    fn test_values_match_across_integer_widths() {
        assert!(values_match(&Value::Int(3), &Value::BigInt(3)));
        assert!(values_match(&Value::from("a"), &Value::from("a")));
        assert!(!values_match(&Value::Null, &Value::Null));
        assert!(values_match(&Value::decimal("6.50"), &Value::decimal("6.5")));
    }
}
