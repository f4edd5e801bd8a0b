//! Error types for trackmodel operations.

use crate::entity::{EntityState, EntryId};
use std::fmt;

/// The primary error type for all trackmodel operations.
#[derive(Debug)]
pub enum Error {
    /// A different tracked entry already owns this (entity, key) pair.
    DuplicateKey { entity: &'static str, key: i64 },
    /// The entity already has a live entry (Added, Unchanged or Modified).
    AlreadyTracked {
        entity: &'static str,
        key: Option<i64>,
        state: EntityState,
    },
    /// A relationship points at an entry that is not tracked (or is being deleted).
    UnresolvedParent {
        entity: &'static str,
        relationship: &'static str,
        target: EntryId,
    },
    /// Added entities reference each other in a cycle.
    DependencyCycle { entities: Vec<String> },
    /// A flush is already running on this session.
    FlushInProgress,
    /// The store rejected a batch; nothing from the batch was applied.
    StoreExecution(StoreExecutionError),
    /// The handle does not name a tracked entry.
    NotTracked { entity: &'static str, entry: EntryId },
    /// The operation needs an entity with a primary key.
    MissingKey { entity: &'static str },
    /// The primary key of a tracked entity was changed in place.
    KeyChanged {
        entity: &'static str,
        from: i64,
        to: Option<i64>,
    },
    /// Field constraint violations
    Validation(ValidationError),
    /// Store-level statement errors (raw passthrough, constraint checks)
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// A batch failure reported by a [`Store`](crate::Store).
#[derive(Debug)]
pub struct StoreExecutionError {
    /// Index of the failing operation inside the batch, when known.
    pub operation_index: Option<usize>,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// The statement text that failed, if the failure came from a raw statement.
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Statement could not be parsed
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Relation or column not found
    NotFound,
    /// Update or delete matched no row
    Concurrency,
    /// Wrong number of bound parameters
    Parameter,
    /// Other store error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open
    AlreadyActive,
    /// No transaction is open
    NotActive,
    /// The handle does not belong to the open transaction
    UnknownHandle,
}

/// Field constraint violations collected for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub entity: &'static str,
    pub errors: Vec<FieldValidationError>,
}

/// A single violated constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    pub field: &'static str,
    pub kind: ValidationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// String is longer than maximum length
    MaxLength,
    /// Decimal exceeds precision or scale
    Decimal,
    /// Required field is missing/null
    Required,
    /// Value doesn't match regex pattern
    Pattern,
}

impl ValidationError {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add(
        &mut self,
        field: &'static str,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field,
            kind,
            message: message.into(),
        });
    }
}

impl Error {
    /// Errors raised by the tracker before the store is touched.
    pub fn is_tracking_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey { .. }
                | Error::AlreadyTracked { .. }
                | Error::UnresolvedParent { .. }
                | Error::DependencyCycle { .. }
                | Error::FlushInProgress
                | Error::NotTracked { .. }
                | Error::MissingKey { .. }
                | Error::KeyChanged { .. }
        )
    }

    /// Index of the failed batch operation, for store execution errors.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            Error::StoreExecution(e) => e.operation_index,
            _ => None,
        }
    }

    /// Get the statement text that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::StoreExecution(e) => e.source.sql(),
            _ => None,
        }
    }

    /// The query error kind, looking through store execution wrappers.
    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self {
            Error::Query(q) => Some(q.kind),
            Error::StoreExecution(e) => e.source.query_kind(),
            _ => None,
        }
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateKey { entity, key } => {
                write!(f, "Duplicate key: {}#{} is already tracked by another entry", entity, key)
            }
            Error::AlreadyTracked { entity, key, state } => match key {
                Some(key) => write!(f, "{}#{} is already tracked as {}", entity, key, state),
                None => write!(f, "{} is already tracked as {}", entity, state),
            },
            Error::UnresolvedParent {
                entity,
                relationship,
                target,
            } => write!(
                f,
                "Unresolved relationship {}.{}: entry {} is not tracked",
                entity, relationship, target
            ),
            Error::DependencyCycle { entities } => {
                write!(f, "Dependency cycle among added entities: {}", entities.join(" -> "))
            }
            Error::FlushInProgress => write!(f, "A flush is already in progress on this session"),
            Error::StoreExecution(e) => write!(f, "{}", e),
            Error::NotTracked { entity, entry } => {
                write!(f, "{} entry {} is not tracked", entity, entry)
            }
            Error::MissingKey { entity } => write!(f, "{} has no primary key", entity),
            Error::KeyChanged { entity, from, to } => match to {
                Some(to) => write!(f, "Primary key of {}#{} changed to {}", entity, from, to),
                None => write!(f, "Primary key of {}#{} was cleared", entity, from),
            },
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StoreExecution(e) => Some(e.source.as_ref()),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for StoreExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation_index {
            Some(index) => write!(f, "Store execution failed at operation {}: {}", index, self.source),
            None => write!(f, "Store execution failed: {}", self.source),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql {
            Some(sql) => write!(f, "{} (in `{}`)", self.message, sql),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "{}.{}: {}", self.entity, err.field, err.message)
        } else {
            writeln!(f, "{} has {} invalid fields:", self.entity, self.errors.len())?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<StoreExecutionError> for Error {
    fn from(err: StoreExecutionError) -> Self {
        Error::StoreExecution(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for trackmodel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_execution_exposes_index_and_sql() {
        let err = Error::StoreExecution(StoreExecutionError {
            operation_index: Some(2),
            source: Box::new(Error::Query(
                QueryError::new(QueryErrorKind::Constraint, "foreign key violation")
                    .with_sql("DELETE FROM vendors WHERE id = $1"),
            )),
        });

        assert_eq!(err.operation_index(), Some(2));
        assert_eq!(err.sql(), Some("DELETE FROM vendors WHERE id = $1"));
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Constraint));
        assert!(!err.is_tracking_error());
        assert!(err.to_string().contains("operation 2"));
    }

    #[test]
    fn tracking_errors_are_flagged() {
        assert!(Error::FlushInProgress.is_tracking_error());
        assert!(
            Error::DuplicateKey {
                entity: "bricks",
                key: 1
            }
            .is_tracking_error()
        );
        assert!(!Error::Cancelled.is_tracking_error());
    }

    #[test]
    fn validation_display_lists_fields() {
        let mut err = ValidationError::new("dishes");
        err.add("title", ValidationErrorKind::MaxLength, "longer than 100 characters");
        assert_eq!(err.to_string(), "dishes.title: longer than 100 characters");

        err.add("stars", ValidationErrorKind::Required, "is required");
        let text = err.to_string();
        assert!(text.starts_with("dishes has 2 invalid fields"));
        assert!(text.contains("  - stars: is required"));
    }
}
