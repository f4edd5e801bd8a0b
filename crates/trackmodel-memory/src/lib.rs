//! In-memory backing store for trackmodel.
//!
//! `trackmodel-memory` is the reference [`Store`](trackmodel_core::Store):
//! tables keyed by integer primary keys, foreign keys and junction relations
//! derived from entity metadata, atomic batches, one writer transaction at
//! a time, and a small parameterized statement language for the raw
//! passthrough.
//!
//! # Example
//!
//! ```ignore
//! use trackmodel_memory::MemoryDatabase;
//!
//! let db = MemoryDatabase::new()
//!     .register::<Dish>()
//!     .register::<Ingredient>();
//! let store = db.store();
//! let rows = store.query_sync("SELECT * FROM dishes WHERE stars = $1", &[Value::Int(4)])?;
//! ```

pub mod database;
pub mod raw;
pub mod store;

pub use database::{ForeignKey, JunctionSchema, MemoryDatabase, Schema, TableSchema};
pub use store::MemoryStore;
