//! The backing store contract.
//!
//! This module defines what the tracker hands to a store and what it
//! expects back:
//!
//! - [`Operation`] - one reconciliation command inside a flush batch
//! - [`Store`] - atomic batch execution, transactions, explicit loading and
//!   the raw statement passthrough
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling.

use crate::entity::EntryId;
use crate::relationship::JunctionInfo;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A junction endpoint: a known key, or the key the store assigns to an
/// insert earlier in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyRef {
    Key(i64),
    Pending(EntryId),
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRef::Key(key) => write!(f, "{}", key),
            KeyRef::Pending(id) => write!(f, "{}", id),
        }
    }
}

/// One reconciliation command.
///
/// `pending_keys` lists foreign key columns whose value is the key assigned
/// to another insert of the same batch; the store fills them in before
/// writing the row.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        entry: EntryId,
        entity: &'static str,
        key_column: &'static str,
        /// Caller-assigned key; `None` lets the store generate one.
        key: Option<i64>,
        values: Vec<(&'static str, Value)>,
        pending_keys: Vec<(&'static str, EntryId)>,
    },
    Update {
        entry: EntryId,
        entity: &'static str,
        key_column: &'static str,
        key: i64,
        changes: Vec<(&'static str, Value)>,
        pending_keys: Vec<(&'static str, EntryId)>,
    },
    Delete {
        entry: EntryId,
        entity: &'static str,
        key_column: &'static str,
        key: i64,
    },
    JunctionInsert {
        junction: JunctionInfo,
        left: KeyRef,
        right: KeyRef,
    },
    JunctionDelete {
        junction: JunctionInfo,
        left: i64,
        right: i64,
    },
}

impl Operation {
    pub const fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::JunctionInsert { .. } => "junction_insert",
            Operation::JunctionDelete { .. } => "junction_delete",
        }
    }

    /// Relation (entity or junction table) the operation writes to.
    pub const fn relation(&self) -> &'static str {
        match self {
            Operation::Insert { entity, .. }
            | Operation::Update { entity, .. }
            | Operation::Delete { entity, .. } => *entity,
            Operation::JunctionInsert { junction, .. } | Operation::JunctionDelete { junction, .. } => {
                junction.table
            }
        }
    }

    /// Tracked entry the operation was planned for.
    pub const fn entry(&self) -> Option<EntryId> {
        match self {
            Operation::Insert { entry, .. }
            | Operation::Update { entry, .. }
            | Operation::Delete { entry, .. } => Some(*entry),
            Operation::JunctionInsert { .. } | Operation::JunctionDelete { .. } => None,
        }
    }

    pub const fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert { entity, entry, .. } => write!(f, "INSERT {} ({})", entity, entry),
            Operation::Update { entity, key, .. } => write!(f, "UPDATE {}#{}", entity, key),
            Operation::Delete { entity, key, .. } => write!(f, "DELETE {}#{}", entity, key),
            Operation::JunctionInsert {
                junction,
                left,
                right,
            } => write!(f, "LINK {} ({}, {})", junction.table, left, right),
            Operation::JunctionDelete {
                junction,
                left,
                right,
            } => write!(f, "UNLINK {} ({}, {})", junction.table, left, right),
        }
    }
}

/// What a successful batch reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Keys assigned to inserted entries.
    pub keys: HashMap<EntryId, i64>,
    pub rows_affected: u64,
}

/// Handle for an open store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(u64);

impl TransactionHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Structured lookup used for explicit loading.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub relation: String,
    /// Equality filter on one column.
    pub filter: Option<(String, Value)>,
}

impl Selection {
    /// Select every row of a relation.
    pub fn all(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            filter: None,
        }
    }

    /// Select the rows whose `column` equals `value`.
    pub fn by(relation: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            relation: relation.into(),
            filter: Some((column.into(), value.into())),
        }
    }
}

/// A backing store.
///
/// Implementations must apply a batch atomically: either every operation
/// takes effect or none does. On failure the error is an
/// [`Error::StoreExecution`](crate::Error::StoreExecution) carrying the index
/// of the operation that failed.
///
/// Raw statements take their parameters only through the structured
/// `params` list.
pub trait Store: Send + Sync {
    /// Execute a reconciliation batch atomically.
    fn execute_batch(
        &self,
        cx: &Cx,
        operations: &[Operation],
    ) -> impl Future<Output = Outcome<BatchResult, crate::Error>> + Send;

    /// Fetch rows matching a structured selection.
    fn select(
        &self,
        cx: &Cx,
        selection: &Selection,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Open a transaction; batches and raw statements join it until it ends.
    fn begin_transaction(
        &self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<TransactionHandle, crate::Error>> + Send;

    fn commit(
        &self,
        cx: &Cx,
        handle: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn rollback(
        &self,
        cx: &Cx,
        handle: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Run a raw query and return its rows.
    fn raw_query(
        &self,
        cx: &Cx,
        text: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Run a raw statement and return the number of affected rows.
    fn raw_execute(
        &self,
        cx: &Cx,
        text: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}
