//! [`Store`] implementation over a [`MemoryDatabase`].
//!
//! Batches run against a copy of the data that replaces the live data only
//! when every operation succeeded. One store at a time may hold a
//! transaction; writes from any other store fail with "database is locked"
//! until it ends, and reads from other stores see the data as it was when
//! the transaction began.

use crate::database::{Data, DatabaseState, MemoryDatabase, OpenTransaction, Schema};
use crate::raw::{self, Statement};
use asupersync::{Cx, Outcome};
use std::collections::HashMap;
use trackmodel_core::{
    BatchResult, EntryId, Error, KeyRef, Operation, QueryError, QueryErrorKind, Result, Row,
    Selection, Store, StoreExecutionError, TransactionError, TransactionErrorKind,
    TransactionHandle, Value,
};

/// A connection-like handle onto a [`MemoryDatabase`].
///
/// Dropping a store rolls back the transaction it holds, if any.
#[derive(Debug)]
pub struct MemoryStore {
    id: u64,
    database: MemoryDatabase,
}

fn database_error(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Database, message))
}

fn concurrency(message: String) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Concurrency, message))
}

fn transaction_error(kind: TransactionErrorKind, message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.to_string(),
    })
}

fn owned(columns: &[(&'static str, Value)]) -> Vec<(String, Value)> {
    columns
        .iter()
        .map(|(c, v)| ((*c).to_string(), v.clone()))
        .collect()
}

/// Write the keys of earlier inserts into their foreign key columns.
fn fill_pending(
    columns: &mut Vec<(String, Value)>,
    pending: &[(&'static str, EntryId)],
    keys: &HashMap<EntryId, i64>,
) -> Result<()> {
    for (column, entry) in pending {
        let key = keys.get(entry).copied().ok_or_else(|| {
            database_error(format!(
                "{} references entry {} which has no key yet",
                column, entry
            ))
        })?;
        match columns.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = Value::BigInt(key),
            None => columns.push(((*column).to_string(), Value::BigInt(key))),
        }
    }
    Ok(())
}

fn resolve(key: KeyRef, keys: &HashMap<EntryId, i64>) -> Result<i64> {
    match key {
        KeyRef::Key(key) => Ok(key),
        KeyRef::Pending(entry) => keys
            .get(&entry)
            .copied()
            .ok_or_else(|| database_error(format!("entry {} has no key yet", entry))),
    }
}

/// Apply one batch operation; returns the rows it affected.
fn apply(
    schema: &Schema,
    data: &mut Data,
    operation: &Operation,
    keys: &mut HashMap<EntryId, i64>,
) -> Result<u64> {
    match operation {
        Operation::Insert {
            entry,
            entity,
            key,
            values,
            pending_keys,
            ..
        } => {
            let mut columns = owned(values);
            fill_pending(&mut columns, pending_keys, keys)?;
            let assigned = data.insert(schema, entity, *key, columns)?;
            keys.insert(*entry, assigned);
            Ok(1)
        }
        Operation::Update {
            entity,
            key,
            changes,
            pending_keys,
            ..
        } => {
            let mut columns = owned(changes);
            fill_pending(&mut columns, pending_keys, keys)?;
            match data.update(schema, entity, *key, columns)? {
                0 => Err(concurrency(format!(
                    "{}#{} was not updated: the row no longer exists",
                    entity, key
                ))),
                n => Ok(n),
            }
        }
        Operation::Delete { entity, key, .. } => match data.delete(schema, entity, *key)? {
            0 => Err(concurrency(format!(
                "{}#{} was not deleted: the row no longer exists",
                entity, key
            ))),
            n => Ok(n),
        },
        Operation::JunctionInsert {
            junction,
            left,
            right,
        } => {
            let (left, right) = (resolve(*left, keys)?, resolve(*right, keys)?);
            data.link(schema, junction.table, left, right)?;
            Ok(1)
        }
        Operation::JunctionDelete {
            junction,
            left,
            right,
        } => match data.unlink(schema, junction.table, *left, *right)? {
            0 => Err(concurrency(format!(
                "{} ({}, {}) was not deleted: the pair no longer exists",
                junction.table, left, right
            ))),
            n => Ok(n),
        },
    }
}

impl MemoryStore {
    pub(crate) fn new(database: MemoryDatabase, id: u64) -> Self {
        Self { id, database }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// Whether this store holds the open transaction.
    pub fn in_transaction(&self) -> bool {
        self.database
            .lock()
            .transaction
            .as_ref()
            .is_some_and(|t| t.owner == self.id)
    }

    fn check_writer(&self, state: &DatabaseState) -> Result<()> {
        match &state.transaction {
            Some(t) if t.owner != self.id => Err(database_error(format!(
                "database is locked by the transaction of store {}",
                t.owner
            ))),
            _ => Ok(()),
        }
    }

    fn visible<'a>(&self, state: &'a DatabaseState) -> &'a Data {
        match &state.transaction {
            Some(t) if t.owner != self.id => &t.saved,
            _ => &state.data,
        }
    }

    /// Apply a batch atomically.
    pub fn execute_batch_sync(&self, operations: &[Operation]) -> Result<BatchResult> {
        let mut state = self.database.lock();
        self.check_writer(&state).map_err(|e| {
            Error::StoreExecution(StoreExecutionError {
                operation_index: None,
                source: Box::new(e),
            })
        })?;

        let mut working = state.data.clone();
        let mut result = BatchResult::default();
        for (index, operation) in operations.iter().enumerate() {
            match apply(&state.schema, &mut working, operation, &mut result.keys) {
                Ok(n) => result.rows_affected += n,
                Err(e) => {
                    tracing::debug!(
                        store = self.id,
                        index,
                        operation = %operation,
                        error = %e,
                        "Batch rejected"
                    );
                    return Err(Error::StoreExecution(StoreExecutionError {
                        operation_index: Some(index),
                        source: Box::new(e),
                    }));
                }
            }
        }

        state.data = working;
        tracing::debug!(
            store = self.id,
            operations = operations.len(),
            rows_affected = result.rows_affected,
            "Batch applied"
        );
        Ok(result)
    }

    pub fn select_sync(&self, selection: &Selection) -> Result<Vec<Row>> {
        let state = self.database.lock();
        let filter = selection.filter.as_ref().map(|(c, v)| (c.as_str(), v));
        self.visible(&state)
            .select(&state.schema, &selection.relation, filter)
    }

    fn begin_sync(&self) -> Result<TransactionHandle> {
        let mut state = self.database.lock();
        match &state.transaction {
            Some(t) if t.owner == self.id => {
                return Err(transaction_error(
                    TransactionErrorKind::AlreadyActive,
                    "Already in a transaction",
                ));
            }
            Some(_) => self.check_writer(&state)?,
            None => {}
        }

        state.next_transaction += 1;
        let handle = TransactionHandle::new(state.next_transaction);
        let saved = state.data.clone();
        state.transaction = Some(OpenTransaction {
            owner: self.id,
            handle,
            saved,
        });
        tracing::debug!(store = self.id, transaction = handle.id(), "Transaction started");
        Ok(handle)
    }

    /// Take the open transaction if it belongs to this store and `handle`.
    fn end(&self, state: &mut DatabaseState, handle: TransactionHandle) -> Result<OpenTransaction> {
        match &state.transaction {
            Some(t) if t.owner == self.id && t.handle == handle => {}
            Some(t) if t.owner == self.id => {
                return Err(transaction_error(
                    TransactionErrorKind::UnknownHandle,
                    "Handle does not belong to the open transaction",
                ));
            }
            _ => {
                return Err(transaction_error(
                    TransactionErrorKind::NotActive,
                    "Not in a transaction",
                ));
            }
        }
        state
            .transaction
            .take()
            .ok_or_else(|| transaction_error(TransactionErrorKind::NotActive, "Not in a transaction"))
    }

    fn commit_sync(&self, handle: TransactionHandle) -> Result<()> {
        let mut state = self.database.lock();
        self.end(&mut state, handle)?;
        tracing::debug!(store = self.id, transaction = handle.id(), "Transaction committed");
        Ok(())
    }

    fn rollback_sync(&self, handle: TransactionHandle) -> Result<()> {
        let mut state = self.database.lock();
        let transaction = self.end(&mut state, handle)?;
        state.data = transaction.saved;
        tracing::debug!(store = self.id, transaction = handle.id(), "Transaction rolled back");
        Ok(())
    }

    /// Run a raw SELECT.
    pub fn query_sync(&self, text: &str, params: &[Value]) -> Result<Vec<Row>> {
        let run = || {
            let statement = Statement::parse(text)?;
            if !statement.is_query() {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Syntax,
                    "raw queries must be SELECT statements",
                )));
            }
            let state = self.database.lock();
            raw::query(self.visible(&state), &state.schema, &statement, params)
        };
        let rows = run().map_err(|e| raw::with_statement(e, text))?;
        tracing::trace!(store = self.id, sql = text, rows = rows.len(), "Raw query");
        Ok(rows)
    }

    /// Run a raw INSERT, UPDATE or DELETE. A failing statement changes nothing.
    pub fn execute_sync(&self, text: &str, params: &[Value]) -> Result<u64> {
        let run = || {
            let statement = Statement::parse(text)?;
            let mut state = self.database.lock();
            self.check_writer(&state)?;
            let mut working = state.data.clone();
            let affected = raw::execute(&mut working, &state.schema, &statement, params)?;
            state.data = working;
            Ok(affected)
        };
        let affected = run().map_err(|e| raw::with_statement(e, text))?;
        tracing::trace!(store = self.id, sql = text, affected, "Raw statement");
        Ok(affected)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let mut state = self.database.lock();
        if let Some(transaction) = state.transaction.take_if(|t| t.owner == self.id) {
            state.data = transaction.saved;
            tracing::warn!(
                store = self.id,
                transaction = transaction.handle.id(),
                "Store dropped inside a transaction; rolled back"
            );
        }
    }
}

// ── Store trait impl ──────────────────────────────────────────────────────

impl Store for MemoryStore {
    fn execute_batch(
        &self,
        _cx: &Cx,
        operations: &[Operation],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let result = self.execute_batch_sync(operations);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn select(
        &self,
        _cx: &Cx,
        selection: &Selection,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.select_sync(selection);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin_transaction(
        &self,
        _cx: &Cx,
    ) -> impl Future<Output = Outcome<TransactionHandle, Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(
        &self,
        _cx: &Cx,
        handle: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync(handle);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(
        &self,
        _cx: &Cx,
        handle: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync(handle);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn raw_query(
        &self,
        _cx: &Cx,
        text: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(text, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn raw_execute(
        &self,
        _cx: &Cx,
        text: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(text, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}
