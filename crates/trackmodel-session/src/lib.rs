//! Session and change tracking for trackmodel.
//!
//! `trackmodel-session` is the **unit-of-work layer**. It keeps one
//! in-memory instance per stored record, remembers what each instance
//! looked like when it was last synchronized, and turns the difference into
//! an ordered batch for a [`Store`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked entry per (entity, key).
//! - **Snapshots**: the values last known to match the store.
//! - **Change tracker**: entity states and change detection.
//! - **Resolver**: foreign keys and junction rows from relationship fields.
//! - **Planner**: parent-first inserts, child-first deletes, one batch.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(store);
//!
//! let vendor = session.add(Vendor::new("Brick Shack"))?;
//! let mut brick = Brick::new("2x4 plate");
//! brick.vendor.set(&vendor);
//! session.add(brick)?;
//!
//! // One batch: vendor insert, brick insert with the vendor's new key.
//! let result = session.save_changes(&cx).await;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod resolver;
pub mod snapshot;

#[cfg(test)]
mod fixtures;

pub use change_tracker::{ChangeTracker, StateCounts, TrackedEntry, TrackedObject, TrackerSavepoint};
pub use flush::{FlushPlan, FlushResult, plan};
pub use identity_map::IdentityMap;
pub use resolver::{JunctionAction, JunctionChange, Resolution, normalize_links, resolve};
pub use snapshot::{CollectionChange, FieldChange, Snapshot, SnapshotStore};

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use trackmodel_core::{
    BatchResult, Entity, EntityRef, EntityState, EntryId, Error, Link, RelationshipKind, Result,
    Row, Selection, Store, StoreExecutionError, TransactionError, TransactionErrorKind,
    TransactionHandle, Value, find_relationship,
};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
///
/// A callback returning an error aborts the operation that fired it (for
/// `before_save`) or is reported to the caller after the fact.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_save: Vec<SessionEventFn>,
    after_save: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_save", &self.before_save.len())
            .field("after_save", &self.after_save.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeSave => &mut self.before_save,
            SessionEvent::AfterSave => &mut self.after_save,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired once the batch is planned, before the store sees it.
    BeforeSave,
    /// Fired after the tracker accepted a successful batch.
    AfterSave,
    /// Fired after the store committed the transaction.
    AfterCommit,
    /// Fired after a rollback, explicit or automatic.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Whether loaded rows become tracked entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTracking {
    /// Loaded rows are resolved through the identity map and tracked.
    #[default]
    Tracking,
    /// Loaded rows are returned as detached copies.
    NoTracking,
}

/// Configuration for session behavior.
///
/// Deserializes from JSON with every field optional:
///
/// ```ignore
/// let config = SessionConfig::from_json(r#"{"query_tracking": "no_tracking"}"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run change detection at the start of every save.
    pub auto_detect_changes: bool,
    /// Default tracking mode for `load_all` and `from_raw`.
    pub query_tracking: QueryTracking,
    /// Check field constraints before the batch reaches the store.
    pub validate_on_save: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            query_tracking: QueryTracking::Tracking,
            validate_on_save: true,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Custom(format!("invalid session config: {}", e)))
    }

    #[must_use]
    pub fn with_auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    #[must_use]
    pub fn with_query_tracking(mut self, tracking: QueryTracking) -> Self {
        self.query_tracking = tracking;
        self
    }

    #[must_use]
    pub fn with_validate_on_save(mut self, enabled: bool) -> Self {
        self.validate_on_save = enabled;
        self
    }
}

// ============================================================================
// Flush Guard
// ============================================================================

/// Holds the session's flushing flag for the duration of a store call.
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::FlushInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// An open store transaction and the journal of the flushes made in it.
#[derive(Debug)]
struct ActiveTransaction {
    handle: TransactionHandle,
    journal: TrackerSavepoint,
    flushes: usize,
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work over a [`Store`].
///
/// All methods take `&self`; tracker state sits behind a mutex that is
/// never held across an await. While a save (or a transaction call) is
/// waiting on the store, every other save and every tracker mutation fails
/// with [`Error::FlushInProgress`].
pub struct Session<S: Store> {
    store: S,
    config: SessionConfig,
    tracker: Mutex<ChangeTracker>,
    flushing: AtomicBool,
    transaction: Mutex<Option<ActiveTransaction>>,
    events: Mutex<SessionEventCallbacks>,
}

impl<S: Store> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tracked", &self.lock_tracker().len())
            .field("flushing", &self.flushing.load(Ordering::Acquire))
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

impl<S: Store> Session<S> {
    /// Create a new session with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(store: S, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            tracker: Mutex::new(ChangeTracker::new()),
            flushing: AtomicBool::new(false),
            transaction: Mutex::new(None),
            events: Mutex::new(SessionEventCallbacks::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock_tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transaction(&self) -> MutexGuard<'_, Option<ActiveTransaction>> {
        self.transaction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_transaction(&self) -> Option<ActiveTransaction> {
        self.lock_transaction().take()
    }

    /// Lock the tracker for a mutation; fails while a flush is pending.
    ///
    /// The flag is read under the tracker lock, and [`Self::start_flush`]
    /// sets it under the same lock.
    fn idle_tracker(&self) -> Result<MutexGuard<'_, ChangeTracker>> {
        let tracker = self.lock_tracker();
        if self.flushing.load(Ordering::Acquire) {
            return Err(Error::FlushInProgress);
        }
        Ok(tracker)
    }

    fn start_flush(&self) -> Result<FlushGuard<'_>> {
        let _tracker = self.lock_tracker();
        FlushGuard::acquire(&self.flushing)
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    fn events_mut(&mut self) -> &mut SessionEventCallbacks {
        self.events.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::result_large_err)]
    fn fire(&self, event: SessionEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fire(event)
    }

    /// Register a callback that runs before a planned batch reaches the store.
    ///
    /// Returning an error aborts the save; nothing is written.
    pub fn on_before_save(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events_mut().before_save.push(Box::new(f));
    }

    /// Register a callback that runs after a successful save.
    pub fn on_after_save(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events_mut().after_save.push(Box::new(f));
    }

    /// Register a callback that runs after a commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events_mut().after_commit.push(Box::new(f));
    }

    /// Register a callback that runs after a rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events_mut().after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Track a new entity; it is inserted by the next save.
    pub fn add<E: Entity>(&self, entity: E) -> Result<EntityRef<E>> {
        self.idle_tracker()?.add(entity)
    }

    /// Track several new entities; on failure none of them is tracked.
    pub fn add_range<E: Entity>(&self, entities: impl IntoIterator<Item = E>) -> Result<Vec<EntityRef<E>>> {
        self.idle_tracker()?.add_range(entities)
    }

    /// Track an entity that already exists in the store, as Unchanged.
    pub fn attach<E: Entity>(&self, entity: E) -> Result<EntityRef<E>> {
        self.idle_tracker()?.attach(entity, false)
    }

    /// Track an existing entity whose every field the next save writes.
    pub fn attach_modified<E: Entity>(&self, entity: E) -> Result<EntityRef<E>> {
        self.idle_tracker()?.attach(entity, true)
    }

    /// Schedule an entity for deletion (an Added entity is simply dropped).
    pub fn remove<E: Entity>(&self, handle: &EntityRef<E>) -> Result<()> {
        self.idle_tracker()?.remove(handle)
    }

    /// Change a tracked entity in place.
    ///
    /// The change is picked up by the next change detection.
    pub fn modify<E: Entity, R>(&self, handle: &EntityRef<E>, f: impl FnOnce(&mut E) -> R) -> Result<R> {
        let mut tracker = self.idle_tracker()?;
        let entity = tracker.get_mut(handle).ok_or(Error::NotTracked {
            entity: E::ENTITY_NAME,
            entry: handle.id(),
        })?;
        Ok(f(entity))
    }

    /// Copy of the tracked entity behind `handle`.
    pub fn entity<E: Entity>(&self, handle: &EntityRef<E>) -> Option<E> {
        self.lock_tracker().get(handle).cloned()
    }

    /// Handle of the entity tracked under `key`, without touching the store.
    pub fn lookup<E: Entity>(&self, key: i64) -> Option<EntityRef<E>> {
        self.lock_tracker().lookup(key)
    }

    pub fn state<E>(&self, handle: &EntityRef<E>) -> EntityState {
        self.lock_tracker().state(handle)
    }

    pub fn entry_for<E: Entity>(&self, handle: &EntityRef<E>) -> TrackedEntry {
        self.lock_tracker().entry_for(handle)
    }

    pub fn entries(&self) -> Vec<TrackedEntry> {
        self.lock_tracker().entries()
    }

    pub fn changes<E: Entity>(&self, handle: &EntityRef<E>) -> Result<Vec<FieldChange>> {
        self.lock_tracker().changes(handle)
    }

    /// Run change detection now; returns how many entries became Modified.
    pub fn detect_changes(&self) -> Result<usize> {
        self.idle_tracker()?.detect_changes()
    }

    pub fn state_counts(&self) -> StateCounts {
        self.lock_tracker().state_counts()
    }

    /// Read-only access to the tracker.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&ChangeTracker) -> R) -> R {
        f(&self.lock_tracker())
    }

    /// Stop tracking every entity.
    pub fn clear(&self) -> Result<()> {
        self.idle_tracker()?.clear();
        tracing::debug!("Session cleared");
        Ok(())
    }

    // ========================================================================
    // Saving
    // ========================================================================

    fn prepare_plan(&self, tracker: &mut ChangeTracker) -> Result<FlushPlan> {
        if self.config.auto_detect_changes {
            tracker.detect_changes()?;
        } else {
            normalize_links(tracker);
        }
        let resolution = resolve(tracker)?;
        plan(tracker, &resolution, self.config.validate_on_save)
    }

    /// Write every pending change to the store as one atomic batch.
    ///
    /// Tracker errors (duplicate keys, unresolved parents, cycles,
    /// validation) are raised before the store is called. If the store
    /// rejects the batch, snapshots and keys are left as they were so the
    /// save can be retried; inside a transaction the transaction is rolled
    /// back first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn save_changes(&self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let _guard = match self.start_flush() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(reason) = cx.cancel_reason() {
            tracing::debug!("Save cancelled before reaching the store");
            return Outcome::Cancelled(reason);
        }

        let started = Instant::now();
        let plan = {
            let mut tracker = self.lock_tracker();
            match self.prepare_plan(&mut tracker) {
                Ok(plan) => plan,
                Err(e) => return Outcome::Err(e),
            }
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to save");
            return Outcome::Ok(FlushResult::new());
        }

        if let Err(e) = self.fire(SessionEvent::BeforeSave) {
            return Outcome::Err(e);
        }

        tracing::debug!(
            operations = plan.operations.len(),
            touched = plan.touched.len(),
            "Executing batch"
        );
        let outcome = if plan.operations.is_empty() {
            Outcome::Ok(BatchResult::default())
        } else {
            self.store.execute_batch(cx, &plan.operations).await
        };
        let result = match outcome {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                let error = match e {
                    Error::StoreExecution(_) => e,
                    other => Error::StoreExecution(StoreExecutionError {
                        operation_index: None,
                        source: Box::new(other),
                    }),
                };
                if let Some(transaction) = self.take_transaction() {
                    self.abort_transaction(cx, transaction, &error).await;
                }
                return Outcome::Err(error);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let accepted = {
            let mut tracker = self.lock_tracker();
            if let Some(transaction) = self.lock_transaction().as_mut() {
                tracker.journal(&mut transaction.journal, &plan);
                transaction.flushes += 1;
            }
            tracker.accept_changes(&plan, &result)
        };
        if let Err(e) = accepted {
            return Outcome::Err(e);
        }

        if let Err(e) = self.fire(SessionEvent::AfterSave) {
            return Outcome::Err(e);
        }

        let summary = plan.summary();
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            junction_inserted = summary.junction_inserted,
            junction_deleted = summary.junction_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Changes saved"
        );
        Outcome::Ok(summary)
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    pub fn in_transaction(&self) -> bool {
        self.lock_transaction().is_some()
    }

    /// Begin a store transaction; saves and raw statements join it.
    pub async fn begin(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = match self.start_flush() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        if self.in_transaction() {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already open on this session".to_string(),
            }));
        }

        match self.store.begin_transaction(cx).await {
            Outcome::Ok(handle) => {
                tracing::debug!(transaction = handle.id(), "Transaction started");
                *self.lock_transaction() = Some(ActiveTransaction {
                    handle,
                    journal: TrackerSavepoint::default(),
                    flushes: 0,
                });
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the open transaction.
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = match self.start_flush() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let Some(transaction) = self.take_transaction() else {
            return Outcome::Err(not_active());
        };

        match self.store.commit(cx, transaction.handle).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                *self.lock_transaction() = Some(transaction);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                *self.lock_transaction() = Some(transaction);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        tracing::info!(
            transaction = transaction.handle.id(),
            flushes = transaction.flushes,
            "Transaction committed"
        );
        if let Err(e) = self.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the open transaction.
    ///
    /// Every entry a save inside the transaction touched goes back to the
    /// state it had before that save, so the changes show as pending again.
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = match self.start_flush() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let Some(transaction) = self.take_transaction() else {
            return Outcome::Err(not_active());
        };

        match self.finish_rollback(cx, transaction).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        if let Err(e) = self.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    async fn finish_rollback(&self, cx: &Cx, transaction: ActiveTransaction) -> Outcome<(), Error> {
        let handle = transaction.handle;
        let outcome = self.store.rollback(cx, handle).await;
        let restored = self.lock_tracker().restore(transaction.journal);
        tracing::info!(
            transaction = handle.id(),
            flushes = transaction.flushes,
            restored,
            "Transaction rolled back"
        );
        outcome
    }

    /// Roll back after a failed store call; failures of the rollback itself
    /// are logged, the original error is what the caller sees.
    async fn abort_transaction(&self, cx: &Cx, transaction: ActiveTransaction, cause: &Error) {
        tracing::warn!(
            transaction = transaction.handle.id(),
            error = %cause,
            "Rolling back transaction after failure"
        );
        match self.finish_rollback(cx, transaction).await {
            Outcome::Ok(()) => {
                if let Err(e) = self.fire(SessionEvent::AfterRollback) {
                    tracing::warn!(error = %e, "after_rollback callback failed");
                }
            }
            Outcome::Err(e) => tracing::warn!(error = %e, "Automatic rollback failed"),
            Outcome::Cancelled(_) => tracing::warn!("Automatic rollback cancelled"),
            Outcome::Panicked(_) => tracing::warn!("Automatic rollback panicked"),
        }
    }

    // ========================================================================
    // Raw Statements
    // ========================================================================

    /// Run a raw query; parameters travel only through `params`.
    pub async fn raw_query(&self, cx: &Cx, text: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        tracing::debug!(sql = text, params = params.len(), "Raw query");
        self.store.raw_query(cx, text, params).await
    }

    /// Run a raw statement; a failure inside a transaction rolls it back.
    pub async fn raw_execute(&self, cx: &Cx, text: &str, params: &[Value]) -> Outcome<u64, Error> {
        let _guard = match self.start_flush() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(sql = text, params = params.len(), "Raw execute");
        match self.store.raw_execute(cx, text, params).await {
            Outcome::Err(e) => {
                if let Some(transaction) = self.take_transaction() {
                    self.abort_transaction(cx, transaction, &e).await;
                }
                Outcome::Err(e)
            }
            other => other,
        }
    }

    /// Materialize raw query rows as entities.
    ///
    /// With [`QueryTracking::Tracking`] each row resolves through the
    /// identity map (a tracked instance wins) and the tracked values are
    /// returned; with `NoTracking` detached copies are returned.
    pub async fn from_raw<E: Entity>(&self, cx: &Cx, text: &str, params: &[Value]) -> Outcome<Vec<E>, Error> {
        let rows = match self.raw_query(cx, text, params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match materialize::<E>(&rows).and_then(|entities| self.resolve_loaded(entities)) {
            Ok(entities) => Outcome::Ok(entities),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Explicit Loading
    // ========================================================================

    async fn select(&self, cx: &Cx, selection: &Selection) -> Outcome<Vec<Row>, Error> {
        tracing::debug!(
            relation = %selection.relation,
            filtered = selection.filter.is_some(),
            "Loading rows"
        );
        self.store.select(cx, selection).await
    }

    fn track_all<E: Entity>(&self, entities: Vec<E>) -> Result<Vec<EntityRef<E>>> {
        let mut tracker = self.idle_tracker()?;
        entities.into_iter().map(|e| tracker.track_loaded(e)).collect()
    }

    fn resolve_loaded<E: Entity>(&self, entities: Vec<E>) -> Result<Vec<E>> {
        match self.config.query_tracking {
            QueryTracking::NoTracking => Ok(entities),
            QueryTracking::Tracking => {
                let handles = self.track_all(entities)?;
                let tracker = self.lock_tracker();
                Ok(handles.iter().filter_map(|h| tracker.get(h).cloned()).collect())
            }
        }
    }

    /// Find an entity by key: the identity map first, then the store.
    ///
    /// A row read from the store is tracked as Unchanged.
    pub async fn find<E: Entity>(&self, cx: &Cx, key: i64) -> Outcome<Option<EntityRef<E>>, Error> {
        let tracked = self.lock_tracker().lookup::<E>(key);
        if let Some(handle) = tracked {
            tracing::trace!(entity = E::ENTITY_NAME, key, "Found in identity map");
            return Outcome::Ok(Some(handle));
        }

        let rows = match self.select(cx, &Selection::by(E::ENTITY_NAME, E::PRIMARY_KEY, key)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let found = materialize::<E>(&rows[..rows.len().min(1)]).and_then(|e| self.track_all(e));
        match found {
            Ok(mut handles) => Outcome::Ok(handles.pop()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Read an entity by key straight from the store, without tracking it.
    pub async fn find_untracked<E: Entity>(&self, cx: &Cx, key: i64) -> Outcome<Option<E>, Error> {
        let rows = match self.select(cx, &Selection::by(E::ENTITY_NAME, E::PRIMARY_KEY, key)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match rows.first().map(E::from_row).transpose() {
            Ok(entity) => Outcome::Ok(entity),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Load every stored entity of a type, honoring the configured
    /// [`QueryTracking`].
    pub async fn load_all<E: Entity>(&self, cx: &Cx) -> Outcome<Vec<E>, Error> {
        let rows = match self.select(cx, &Selection::all(E::ENTITY_NAME)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match materialize::<E>(&rows).and_then(|entities| self.resolve_loaded(entities)) {
            Ok(entities) => Outcome::Ok(entities),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Load and track the children of a one-to-many relationship.
    pub async fn load_children<P: Entity, C: Entity>(
        &self,
        cx: &Cx,
        parent: &EntityRef<P>,
        relationship: &str,
    ) -> Outcome<Vec<EntityRef<C>>, Error> {
        let Some(foreign_key) = find_relationship::<P>(relationship)
            .filter(|r| r.kind == RelationshipKind::OneToMany && r.related_entity == C::ENTITY_NAME)
            .and_then(|r| r.foreign_key)
        else {
            return Outcome::Err(Error::Custom(format!(
                "{} has no one-to-many relationship '{}' to {}",
                P::ENTITY_NAME,
                relationship,
                C::ENTITY_NAME
            )));
        };
        let key = match self.tracked_key(parent) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };

        let rows = match self.select(cx, &Selection::by(C::ENTITY_NAME, foreign_key, key)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match materialize::<C>(&rows).and_then(|children| self.track_all(children)) {
            Ok(handles) => Outcome::Ok(handles),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Load the links of a many-to-many collection from its junction rows.
    ///
    /// The collection snapshot becomes what the store holds; additions and
    /// removals not yet saved are kept. Returns the merged collection.
    pub async fn load_collection<E: Entity>(
        &self,
        cx: &Cx,
        handle: &EntityRef<E>,
        relationship: &str,
    ) -> Outcome<Vec<Link>, Error> {
        let Some((junction, own, other)) = find_relationship::<E>(relationship)
            .filter(|r| r.kind == RelationshipKind::ManyToMany)
            .and_then(|r| Some((r.junction?, r.own_junction_column()?, r.other_junction_column()?)))
        else {
            return Outcome::Err(Error::Custom(format!(
                "{} has no many-to-many relationship '{}'",
                E::ENTITY_NAME,
                relationship
            )));
        };
        let key = match self.tracked_key(handle) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };

        let rows = match self.select(cx, &Selection::by(junction.table, own, key)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let stored: Vec<Link> = rows
            .iter()
            .filter_map(|row| row.get_by_name(other).and_then(Value::as_i64))
            .map(Link::Key)
            .collect();

        let merged = self
            .idle_tracker()
            .and_then(|mut tracker| tracker.merge_collection(handle, relationship, stored));
        match merged {
            Ok(links) => Outcome::Ok(links),
            Err(e) => Outcome::Err(e),
        }
    }

    fn tracked_key<E: Entity>(&self, handle: &EntityRef<E>) -> Result<i64> {
        let tracker = self.lock_tracker();
        let entity = tracker.get(handle).ok_or(Error::NotTracked {
            entity: E::ENTITY_NAME,
            entry: handle.id(),
        })?;
        entity.key().ok_or(Error::MissingKey {
            entity: E::ENTITY_NAME,
        })
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Get a snapshot of the session state for debugging.
    pub fn debug_info(&self) -> SessionDebugInfo {
        let (counts, entries) = {
            let tracker = self.lock_tracker();
            let entries = tracker
                .entries()
                .into_iter()
                .map(|entry| EntryDebugInfo {
                    entry: entry.id,
                    entity: entry.entity,
                    key: entry.key,
                    state: entry.state,
                })
                .collect();
            (tracker.state_counts(), entries)
        };
        let (in_transaction, journaled) = match self.lock_transaction().as_ref() {
            Some(transaction) => (true, transaction.journal.len()),
            None => (false, 0),
        };

        SessionDebugInfo {
            tracked: counts.total(),
            added: counts.added,
            unchanged: counts.unchanged,
            modified: counts.modified,
            deleted: counts.deleted,
            in_transaction,
            journaled,
            flushing: self.flushing.load(Ordering::Acquire),
            entries,
        }
    }
}

fn not_active() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: "no transaction is open on this session".to_string(),
    })
}

fn materialize<E: Entity>(rows: &[Row]) -> Result<Vec<E>> {
    rows.iter().map(E::from_row).collect()
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Total tracked entries.
    pub tracked: usize,
    pub added: usize,
    pub unchanged: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Whether a transaction is open.
    pub in_transaction: bool,
    /// Entries journaled by saves inside the open transaction.
    pub journaled: usize,
    /// Whether a save is waiting on the store.
    pub flushing: bool,
    pub entries: Vec<EntryDebugInfo>,
}

/// One tracked entry in [`SessionDebugInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct EntryDebugInfo {
    pub entry: EntryId,
    pub entity: &'static str,
    pub key: Option<i64>,
    pub state: EntityState,
}
