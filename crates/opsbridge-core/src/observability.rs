//! Observability infrastructure for opsbridge.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the engine and
//! the entry-point binary. Secret-bearing values (API tokens, bearer
//! credentials) are never placed on spans or events.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `opsbridge_engine=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one bridge invocation.
///
/// # Example
///
/// ```rust
/// use opsbridge_core::observability::invocation_span;
///
/// let span = invocation_span("workflow.run", "inc-42");
/// let _guard = span.enter();
/// // ... handle the event
/// ```
#[must_use]
pub fn invocation_span(event_kind: &str, incident_id: &str) -> Span {
    tracing::info_span!(
        "invocation",
        event_kind = event_kind,
        incident_id = incident_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn invocation_span_accepts_fields() {
        let span = invocation_span("incident.created", "inc-1");
        let _guard = span.enter();
        tracing::info!("message inside span");
    }
}
