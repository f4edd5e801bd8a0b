//! trackmodel - entity change tracking and persistence reconciliation.
//!
//! trackmodel keeps one in-memory instance per stored record, remembers what
//! each instance looked like when it was last synchronized, and writes the
//! difference back as a single ordered batch:
//!
//! - Identity map: one tracked entry per (entity, key)
//! - Snapshots and change detection by value comparison
//! - Foreign keys and junction rows resolved from relationship fields
//! - Parent-first inserts, child-first deletes, atomic batches
//! - Transactions with tracker rollback
//! - Raw statements with structured parameters
//!
//! # Quick Start
//!
//! ```ignore
//! use trackmodel::prelude::*;
//!
//! let db = MemoryDatabase::new()
//!     .register::<Dish>()
//!     .register::<Ingredient>();
//! let session = trackmodel::open(&db, SessionConfig::default());
//!
//! let dish = session.add(Dish::new("Breakfast Porridge"))?;
//! let mut oats = Ingredient::new("Oats", "cup", "1.00");
//! oats.dish.set(&dish);
//! session.add(oats)?;
//!
//! // dish first, then the ingredient with the dish's new key
//! let result = session.save_changes(&cx).await;
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: async operations take an asupersync `Cx` and
//!   return `Outcome`
//! - **Store agnostic**: anything implementing [`Store`] can back a session;
//!   [`MemoryStore`] ships as the reference engine
//! - **Validation**: field constraints are checked before the store is called

// Re-export all public types from sub-crates
pub use trackmodel_core::{
    // asupersync re-exports
    Budget,
    // Core types
    BatchResult,
    Cx,
    Entity,
    EntityRef,
    EntityState,
    EntryId,
    Error,
    FieldConstraint,
    FromValue,
    JunctionInfo,
    KeyRef,
    Link,
    Operation,
    Outcome,
    QueryError,
    QueryErrorKind,
    RegionId,
    // Relationships
    Related,
    RelatedMany,
    RelationshipInfo,
    RelationshipKind,
    Result,
    Row,
    Selection,
    Store,
    StoreExecutionError,
    TaskId,
    TransactionError,
    TransactionErrorKind,
    TransactionHandle,
    ValidationError,
    ValidationErrorKind,
    Value,
};

pub use trackmodel_session::{
    ChangeTracker, EntryDebugInfo, FieldChange, FlushPlan, FlushResult, QueryTracking, Session,
    SessionConfig, SessionDebugInfo, SessionEvent, StateCounts, TrackedEntry,
};

pub use trackmodel_memory::{MemoryDatabase, MemoryStore, Schema};

/// A session over the in-memory store.
pub type MemorySession = Session<MemoryStore>;

/// Open a session on a fresh store of `database`.
pub fn open(database: &MemoryDatabase, config: SessionConfig) -> MemorySession {
    let store = database.store();
    tracing::debug!(store = store.id(), ?config, "Opening session");
    Session::with_config(store, config)
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        // Core traits and types
        Entity,
        EntityRef,
        EntityState,
        Error,
        FieldConstraint,
        JunctionInfo,
        Link,
        // Memory store
        MemoryDatabase,
        MemorySession,
        MemoryStore,
        Outcome,
        QueryTracking,
        Related,
        RelatedMany,
        RelationshipInfo,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        Store,
        Value,
    };
}
