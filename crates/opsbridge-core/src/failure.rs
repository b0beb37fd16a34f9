//! Failure classification for remote job errors.
//!
//! The remote systems do not return structured error codes, so terminal
//! failures are categorized by ordered substring checks against the
//! lower-cased error text. The category is attached to the incident as a
//! machine-readable routing signal, distinct from the human-readable note.

use std::fmt;

/// Prefix of the machine-readable routing signal written to the incident.
const ROUTING_SIGNAL_PREFIX: &str = "ROUTING::";

/// Category of a terminal automation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// The job or its target is misconfigured.
    Configuration,
    /// A required job input was missing or blank.
    MissingInput,
    /// A downstream dependency timed out.
    DependencyTimeout,
    /// The caller lacked permission on a downstream system.
    Authorization,
    /// The job-runner API rejected the request.
    RunnerApi,
    /// Nothing matched.
    Unknown,
}

impl FailureCategory {
    /// Returns the stable machine-readable code for this category.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::MissingInput => "MISSING_INPUT",
            Self::DependencyTimeout => "DEPENDENCY_TIMEOUT",
            Self::Authorization => "AUTH_ERROR",
            Self::RunnerApi => "RUNNER_API_ERROR",
            Self::Unknown => "UNKNOWN_FAILURE",
        }
    }

    /// Renders the routing signal written onto the incident.
    #[must_use]
    pub fn routing_signal(self) -> String {
        format!("{ROUTING_SIGNAL_PREFIX}{}", self.code())
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Classifies error text into a [`FailureCategory`].
///
/// Checks run in a fixed order; the first match wins.
#[must_use]
pub fn classify_failure(text: &str) -> FailureCategory {
    let t = text.to_lowercase();

    if t.contains("invalid cloud account id") || t.contains("invalid aws account id") {
        return FailureCategory::Configuration;
    }
    if t.contains("missing required") || t.contains("required option") {
        return FailureCategory::MissingInput;
    }
    if t.contains("read timed out")
        || t.contains("connection timed out")
        || t.contains("operation timed out")
    {
        return FailureCategory::DependencyTimeout;
    }
    if t.contains("access denied") || t.contains("not authorized") {
        return FailureCategory::Authorization;
    }
    if t.contains("start error") {
        return FailureCategory::RunnerApi;
    }

    FailureCategory::Unknown
}
