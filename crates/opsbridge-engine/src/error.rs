//! Error types for the orchestration engine.
//!
//! Errors carry explicit classification data (HTTP status, raw bodies,
//! execution state) instead of encoding it in message text, so the router
//! can pattern-match without string sniffing. Display strings still feed
//! the substring-based failure classifier, since remote systems offer no
//! structured errors at their boundary.

use opsbridge_core::options::OptionsError;

/// The result type used throughout opsbridge-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum characters of a start-rejection body rendered in error text.
const START_BODY_PREVIEW: usize = 300;

fn preview(body: &str) -> String {
    body.chars().take(START_BODY_PREVIEW).collect()
}

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job runner rejected a start request, returned an unparseable
    /// body, or omitted the execution identifier.
    #[error("job runner start error {status}: {}", preview(.body))]
    StartRejected {
        /// HTTP status of the rejection (502 for synthetic parse failures).
        status: u16,
        /// The raw response body, captured once before any inspection.
        body: String,
    },

    /// Polling exhausted its attempt budget without remote completion.
    #[error("execution {execution_id} did not complete within the polling budget")]
    PollTimeout {
        /// The execution still running when the budget ran out.
        execution_id: String,
    },

    /// The execution reached a terminal state other than success.
    #[error("execution {execution_id} finished in terminal state '{state}'")]
    ExecutionFailed {
        /// The execution that failed.
        execution_id: String,
        /// The remote terminal state as reported.
        state: String,
    },

    /// A collaborator returned an unexpected HTTP status.
    #[error("job runner responded {status} while {context}")]
    UpstreamStatus {
        /// The HTTP status received.
        status: u16,
        /// What the engine was doing at the time.
        context: String,
    },

    /// A transport-level HTTP failure after any local retries.
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The guard store failed for infrastructure reasons (not a
    /// conditional-check conflict).
    #[error("guard store error: {message}")]
    GuardStore {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Option building rejected the payload.
    #[error("options build failure: {0}")]
    Options(#[from] OptionsError),

    /// A poll continuation could not be dispatched.
    #[error("continuation dispatch failed: {message}")]
    Continuation {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Creates a new guard store error.
    #[must_use]
    pub fn guard_store(message: impl Into<String>) -> Self {
        Self::GuardStore {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new guard store error with a source.
    #[must_use]
    pub fn guard_store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::GuardStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new continuation dispatch error.
    #[must_use]
    pub fn continuation(message: impl Into<String>) -> Self {
        Self::Continuation {
            message: message.into(),
        }
    }
}
