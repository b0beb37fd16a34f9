//! # opsbridge-engine
//!
//! The idempotent orchestration engine of the opsbridge incident-automation
//! bridge. Incoming incident events route to diagnostic or remediation jobs
//! on a remote job runner; completion is awaited under bounded retries; a
//! normalized report is written back onto the incident.
//!
//! This crate provides:
//!
//! - **Idempotency guard**: lease-style mutual exclusion over a shared
//!   conditional-write store, suppressing duplicate triggers, notes, and
//!   mirror writes across racing invocations
//! - **Collaborator clients**: the incident-management API and the job
//!   runner API, with per-call timeouts and bounded retry
//! - **Job orchestrator**: the start → poll → fetch state machine
//! - **Event router**: the top-level decision logic, including the
//!   asynchronous poll continuation path
//! - **Configuration**: environment loading plus cached remote snapshot
//!   overrides
//!
//! ## Guarantees
//!
//! - **Duplicate suppression**: at most one successful lease acquisition per
//!   guard key inside any rolling TTL window
//! - **Terminal outcomes always land**: every handled event ends in exactly
//!   one note (guard-deduped) and one mirror/ready signal on the incident
//! - **Business failures are 200s**: routing misses, start rejections, and
//!   poll timeouts report as structured successes; only an unhandled
//!   internal fault yields a 500, and a best-effort note/mirror is attempted
//!   first

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod continuation;
pub mod error;
pub mod guard;
pub mod incident;
pub mod metrics;
pub mod orchestrator;
pub mod report;
pub mod response;
pub mod router;
pub mod runner;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CachedConfig, ConfigOverrides, EngineConfig, SnapshotSource};
    pub use crate::continuation::{ContinuationEvent, ContinuationSink, InMemoryContinuationSink};
    pub use crate::error::{Error, Result};
    pub use crate::guard::memory::InMemoryGuardStore;
    pub use crate::guard::{FailPolicy, GuardLease, GuardStore, IdempotencyGuard, WriteOutcome};
    pub use crate::orchestrator::{Execution, ExecutionState, Orchestrator};
    pub use crate::response::HandlerResponse;
    pub use crate::router::{EventRouter, RoutingDecision};
}
