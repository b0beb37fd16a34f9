//! Lease-style idempotency guard over a shared conditional-write store.
//!
//! Invocations of the bridge may race: two deliveries of the same event, or
//! a synchronous start followed by an out-of-band continuation. All
//! cross-invocation coordination happens here, against a store that offers
//! two atomic primitives:
//!
//! - **insert-if-absent**: create a lease row, failing if the key exists
//! - **refresh-if-expired**: overwrite a lease row only if its stored
//!   timestamp is older than a cutoff
//!
//! Acquisition tries the insert first; on conflict it tries the conditional
//! refresh with `cutoff = now - ttl`. A second conflict means another,
//! more-recent acquisition holds the lease — the duplicate is suppressed.
//! At most one acquisition can succeed for a key inside any rolling TTL
//! window; expired leases are replaced, never reused.
//!
//! Rows are never deleted by the engine; they expire passively at the store.
//!
//! ## Failure policy
//!
//! Infrastructure errors from the store (anything but a conditional-check
//! conflict) follow a configurable policy: fail-open proceeds (may
//! double-trigger), fail-closed suppresses (may under-trigger). The
//! tradeoff is explicit, never hardcoded.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::metrics::EngineMetrics;

/// Placeholder scope used when a guard scope is empty.
const EMPTY_SCOPE: &str = "nokey";

/// A lease row as stored in the guard store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardLease {
    /// When the lease was acquired (epoch seconds).
    pub acquired_at: i64,
    /// When the row becomes eligible for passive expiry (epoch seconds).
    pub expires_at: i64,
}

impl GuardLease {
    /// Creates a lease acquired now with the given TTL.
    #[must_use]
    pub fn new(now: i64, ttl: Duration) -> Self {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            acquired_at: now,
            expires_at: now.saturating_add(ttl_secs),
        }
    }
}

/// Result of a conditional write against the guard store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Applied,
    /// The condition did not hold; nothing was written.
    Conflict,
}

impl WriteOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Shared guard store abstraction.
///
/// Both operations must be atomic at the store. Conditional-check failures
/// are [`WriteOutcome::Conflict`], never errors; errors are reserved for
/// infrastructure faults and are subject to the configured [`FailPolicy`].
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Creates a lease row, failing if the key already exists.
    async fn insert_new(&self, key: &str, lease: GuardLease) -> Result<WriteOutcome>;

    /// Overwrites a lease row only if the stored acquisition timestamp is
    /// strictly older than `cutoff` (or the row is missing).
    async fn refresh_expired(&self, key: &str, lease: GuardLease, cutoff: i64)
    -> Result<WriteOutcome>;
}

/// Behavior on guard-store infrastructure errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailPolicy {
    /// Proceed as if the lease was acquired (may double-trigger).
    Open,
    /// Suppress as if the lease was held (may under-trigger).
    #[default]
    Closed,
}

impl FailPolicy {
    /// Returns the acquisition result to report when the store errors.
    #[must_use]
    pub const fn proceed_on_error(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Time-windowed mutual exclusion over the guard store.
///
/// Reused for three purposes with distinct scope keys and TTLs: suppressing
/// duplicate job triggers, duplicate timeline notes, and duplicate
/// mirror/ready writes. Acquiring one scope never blocks the others.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn GuardStore>,
    policy: FailPolicy,
    metrics: EngineMetrics,
}

impl IdempotencyGuard {
    /// Creates a guard over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn GuardStore>, policy: FailPolicy) -> Self {
        Self {
            store,
            policy,
            metrics: EngineMetrics::new(),
        }
    }

    /// Builds the composite store key for an incident-scoped lease.
    #[must_use]
    pub fn key(incident_id: &str, scope: &str) -> String {
        let scope = if scope.is_empty() { EMPTY_SCOPE } else { scope };
        format!("guard#{incident_id}#{scope}")
    }

    /// Attempts to acquire the lease for `(incident_id, scope)`.
    ///
    /// Returns true when this caller holds the only successful acquisition
    /// inside the rolling `ttl` window; false when a more recent
    /// acquisition suppresses this one. Store infrastructure errors follow
    /// the configured [`FailPolicy`].
    pub async fn acquire(&self, incident_id: &str, scope: &str, ttl: Duration) -> bool {
        let key = Self::key(incident_id, scope);
        let now = Utc::now().timestamp();
        let lease = GuardLease::new(now, ttl);
        let cutoff = now.saturating_sub(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));

        match self.store.insert_new(&key, lease).await {
            Ok(WriteOutcome::Applied) => {
                tracing::debug!(key = %key, "guard lease created");
                self.metrics.record_guard("acquired");
                return true;
            }
            Ok(WriteOutcome::Conflict) => {}
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "guard insert error");
                self.metrics.record_guard("error");
                return self.policy.proceed_on_error();
            }
        }

        match self.store.refresh_expired(&key, lease, cutoff).await {
            Ok(WriteOutcome::Applied) => {
                tracing::debug!(key = %key, "guard lease refreshed after window elapsed");
                self.metrics.record_guard("refreshed");
                true
            }
            Ok(WriteOutcome::Conflict) => {
                tracing::info!(key = %key, "guard held; duplicate suppressed");
                self.metrics.record_guard("suppressed");
                false
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "guard refresh error");
                self.metrics.record_guard("error");
                self.policy.proceed_on_error()
            }
        }
    }
}
