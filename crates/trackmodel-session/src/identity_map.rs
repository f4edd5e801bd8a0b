//! Identity Map: one tracked entry per (entity, primary key).
//!
//! The map guarantees that a tracker never holds two entries for the same
//! logical row. It stores entry ids only; the entries themselves live in the
//! [`ChangeTracker`](crate::ChangeTracker) arena.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.register("dishes", 4, entry)?;
//! assert_eq!(map.lookup("dishes", 4), Some(entry));
//!
//! // A different entry cannot claim the same key.
//! assert!(map.register("dishes", 4, other).is_err());
//! ```

use std::collections::HashMap;
use trackmodel_core::{EntryId, Error, Result};

/// Maps (entity name, key) to the tracked entry that owns it.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    entries: HashMap<(&'static str, i64), EntryId>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `key` to `entry`.
    ///
    /// Registering the same entry twice is a no-op. Fails with
    /// [`Error::DuplicateKey`] if another entry already owns the key.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, entity: &'static str, key: i64, entry: EntryId) -> Result<()> {
        match self.entries.get(&(entity, key)) {
            Some(existing) if *existing == entry => Ok(()),
            Some(existing) => {
                tracing::debug!(
                    entity,
                    key,
                    existing = %existing,
                    rejected = %entry,
                    "Identity map rejected duplicate key"
                );
                Err(Error::DuplicateKey { entity, key })
            }
            None => {
                tracing::trace!(entity, key, entry = %entry, "Identity map registered entry");
                self.entries.insert((entity, key), entry);
                Ok(())
            }
        }
    }

    /// Find the entry owning `key`.
    pub fn lookup(&self, entity: &str, key: i64) -> Option<EntryId> {
        let entries: &HashMap<(&str, i64), EntryId> = &self.entries;
        entries.get(&(entity, key)).copied()
    }

    /// Remove the mapping for `key`; returns the entry that owned it.
    pub fn forget(&mut self, entity: &'static str, key: i64) -> Option<EntryId> {
        let removed = self.entries.remove(&(entity, key));
        if let Some(entry) = removed {
            tracing::trace!(entity, key, entry = %entry, "Identity map forgot entry");
        }
        removed
    }

    pub fn contains(&self, entity: &'static str, key: i64) -> bool {
        self.entries.contains_key(&(entity, key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut map = IdentityMap::new();
        let entry = EntryId::next();

        map.register("dishes", 1, entry).unwrap();
        assert_eq!(map.lookup("dishes", 1), Some(entry));
        assert_eq!(map.lookup("dishes", 2), None);
        assert_eq!(map.lookup("ingredients", 1), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_same_entry_registers_twice() {
        let mut map = IdentityMap::new();
        let entry = EntryId::next();
        map.register("dishes", 1, entry).unwrap();
        map.register("dishes", 1, entry).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut map = IdentityMap::new();
        map.register("dishes", 1, EntryId::next()).unwrap();

        let err = map.register("dishes", 1, EntryId::next()).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { entity: "dishes", key: 1 }));
    }

    #[test]
    fn test_forget() {
        let mut map = IdentityMap::new();
        let entry = EntryId::next();
        map.register("dishes", 1, entry).unwrap();

        assert_eq!(map.forget("dishes", 1), Some(entry));
        assert_eq!(map.forget("dishes", 1), None);
        assert!(!map.contains("dishes", 1));
        assert!(map.is_empty());
    }
}
