//! In-memory guard store implementation.
//!
//! This module provides [`InMemoryGuardStore`], a thread-safe in-memory
//! implementation of the [`GuardStore`] trait.
//!
//! ## Limitations
//!
//! - **Single-process only**: leases are not shared across process
//!   boundaries, so duplicate suppression holds only within one instance
//! - **No passive expiry**: rows persist until the process exits; the
//!   refresh-if-expired path still honors the TTL window

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{GuardLease, GuardStore, WriteOutcome};
use crate::error::{Error, Result};

/// In-memory guard store.
///
/// Backs the entry-point binary's single-instance deployments and every
/// test; a shared conditional-write KV store plugs in behind the same trait
/// for multi-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryGuardStore {
    rows: RwLock<HashMap<String, GuardLease>>,
}

/// Converts a lock poison error to a guard store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::guard_store("guard lock poisoned")
}

impl InMemoryGuardStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored lease for a key, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn lease(&self, key: &str) -> Result<Option<GuardLease>> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows.get(key).copied())
    }

    /// Returns the number of lease rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row_count(&self) -> Result<usize> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows.len())
    }

    /// Rewinds a stored lease's acquisition timestamp by `seconds`.
    ///
    /// Test helper for simulating an elapsed dedupe window without
    /// sleeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn backdate(&self, key: &str, seconds: i64) -> Result<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        if let Some(lease) = rows.get_mut(key) {
            lease.acquired_at -= seconds;
            lease.expires_at -= seconds;
        }
        Ok(())
    }
}

#[async_trait]
impl GuardStore for InMemoryGuardStore {
    async fn insert_new(&self, key: &str, lease: GuardLease) -> Result<WriteOutcome> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        if rows.contains_key(key) {
            return Ok(WriteOutcome::Conflict);
        }
        rows.insert(key.to_string(), lease);
        Ok(WriteOutcome::Applied)
    }

    async fn refresh_expired(
        &self,
        key: &str,
        lease: GuardLease,
        cutoff: i64,
    ) -> Result<WriteOutcome> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        match rows.get(key) {
            Some(existing) if existing.acquired_at >= cutoff => Ok(WriteOutcome::Conflict),
            _ => {
                rows.insert(key.to_string(), lease);
                Ok(WriteOutcome::Applied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_new_conflicts_on_existing_key() {
        let store = InMemoryGuardStore::new();
        let lease = GuardLease::new(100, std::time::Duration::from_secs(5));
        assert_eq!(store.insert_new("k", lease).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(store.insert_new("k", lease).await.unwrap(), WriteOutcome::Conflict);
        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_applies_only_past_cutoff() {
        let store = InMemoryGuardStore::new();
        let first = GuardLease::new(100, std::time::Duration::from_secs(5));
        store.insert_new("k", first).await.unwrap();

        let newer = GuardLease::new(104, std::time::Duration::from_secs(5));
        // Stored timestamp 100 is not older than cutoff 99.
        assert_eq!(
            store.refresh_expired("k", newer, 99).await.unwrap(),
            WriteOutcome::Conflict,
        );
        // Stored timestamp 100 is older than cutoff 101.
        assert_eq!(
            store.refresh_expired("k", newer, 101).await.unwrap(),
            WriteOutcome::Applied,
        );
        assert_eq!(store.lease("k").unwrap().unwrap().acquired_at, 104);
    }

    #[tokio::test]
    async fn refresh_on_missing_key_inserts() {
        let store = InMemoryGuardStore::new();
        let lease = GuardLease::new(100, std::time::Duration::from_secs(5));
        assert_eq!(
            store.refresh_expired("absent", lease, 50).await.unwrap(),
            WriteOutcome::Applied,
        );
        assert_eq!(store.lease("absent").unwrap(), Some(lease));
    }
}
