//! Core types and traits for trackmodel.
//!
//! This crate provides the vocabulary shared by the tracker and the stores:
//!
//! - `Entity` trait and the `EntityRef`/`Link` handles for tracked entities
//! - `Related`/`RelatedMany` relationship fields and their static metadata
//! - `Store` trait and the `Operation` batch vocabulary
//! - `Value`/`Row` for field values and store results
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod constraint;
pub mod entity;
pub mod error;
pub mod relationship;
pub mod row;
pub mod store;
pub mod value;

pub use constraint::{FieldConstraint, validate_row};
pub use entity::{Entity, EntityRef, EntityState, EntryId, Link};
pub use error::{
    Error, FieldValidationError, QueryError, QueryErrorKind, Result, StoreExecutionError,
    TransactionError, TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use relationship::{
    JunctionInfo, Related, RelatedMany, RelationshipInfo, RelationshipKind, find_relationship,
};
pub use row::{FromValue, Row};
pub use store::{BatchResult, KeyRef, Operation, Selection, Store, TransactionHandle};
pub use value::Value;
