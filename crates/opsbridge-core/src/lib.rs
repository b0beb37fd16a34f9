//! # opsbridge-core
//!
//! Domain logic for the opsbridge incident-automation bridge.
//!
//! This crate holds the pure, I/O-free parts of the bridge:
//!
//! - **Event model**: parsing the incoming notification envelope into an
//!   [`event::IncidentEvent`]
//! - **Field resolution**: dotted-path lookups into nested incident payloads,
//!   including custom-field normalization
//! - **Option building**: mapping payload fields to job parameters
//! - **Failure classification**: substring-based categorization of remote
//!   error text into a small fixed taxonomy
//! - **Output normalization**: turning noisy, ANSI-colored, duplicate-laden
//!   execution logs into a stable, deduplicated report
//!
//! ## Guarantees
//!
//! - **Total**: resolvers and normalizers never fail; absent data yields
//!   absent results, malformed data yields best-effort text
//! - **Deterministic**: the same payload always produces the same options,
//!   the same log always produces the same report
//! - **Idempotent**: normalizing already-normalized output is a no-op
//!
//! The engine crate (`opsbridge-engine`) layers collaborator clients, the
//! idempotency guard, and routing on top of these primitives.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod event;
pub mod failure;
pub mod fields;
pub mod normalize;
pub mod observability;
pub mod options;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::event::{AutomationMode, EventKind, IncidentEvent};
    pub use crate::failure::{FailureCategory, classify_failure};
    pub use crate::fields::{normalize_custom_fields, normalize_key, resolve, sanitize_option_key};
    pub use crate::normalize::{normalize_log_lines, normalize_text};
    pub use crate::options::{OptionMaps, build_options};
}
