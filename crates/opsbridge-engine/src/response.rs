//! Handler response envelope.
//!
//! Every handled event produces `{statusCode, body: {status, ...context}}`.
//! Business-logic failures (routing misses, start rejections, timeouts) are
//! deliberately reported as 200s with a descriptive status so the upstream
//! delivery system does not retry the whole event; only an unhandled
//! internal fault produces a 500.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// The response returned for one handled event.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerResponse {
    /// HTTP-style status code: 200 for every business outcome, 500 only for
    /// unhandled internal faults.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Structured response body.
    pub body: ResponseBody,
}

/// Body of a [`HandlerResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct ResponseBody {
    /// Machine-readable outcome status (e.g. `accepted`, `ignored_event`).
    pub status: String,
    /// Additional context fields, flattened into the body.
    #[serde(flatten)]
    pub context: BTreeMap<String, Value>,
}

impl HandlerResponse {
    /// Creates a 200 response with the given outcome status.
    #[must_use]
    pub fn ok(status: impl Into<String>) -> Self {
        Self::with_code(200, status)
    }

    /// Creates a 500 response for an unhandled internal fault.
    #[must_use]
    pub fn internal_error(status: impl Into<String>) -> Self {
        Self::with_code(500, status)
    }

    fn with_code(status_code: u16, status: impl Into<String>) -> Self {
        Self {
            status_code,
            body: ResponseBody {
                status: status.into(),
                context: BTreeMap::new(),
            },
        }
    }

    /// Attaches a context field to the response body.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.context.insert(key.into(), value.into());
        self
    }

    /// Returns the outcome status string.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.body.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_flattened_context() {
        let response = HandlerResponse::ok("accepted")
            .with("incident_id", "inc-1")
            .with("execution_id", "42");
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["body"]["status"], "accepted");
        assert_eq!(json["body"]["incident_id"], "inc-1");
        assert_eq!(json["body"]["execution_id"], "42");
    }

    #[test]
    fn internal_error_uses_500() {
        let response = HandlerResponse::internal_error("exception").with("error", "boom");
        assert_eq!(response.status_code, 500);
        assert_eq!(response.status(), "exception");
    }
}
