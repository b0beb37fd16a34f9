//! Incoming event envelope model.
//!
//! Notifications arrive as JSON envelopes of the form
//! `{"event": {"type": ...}, "data": {...}}`, optionally wrapped one level
//! deeper under a `body` key (which may itself be a JSON-encoded string).
//! Parsing is forgiving by design: malformed bodies collapse to an empty
//! object so the caller can acknowledge and ignore them instead of erroring
//! back to the delivery system.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::{normalize_custom_fields, value_to_string};

/// Wire type of the internal poll-continuation event.
pub const CONTINUATION_EVENT_TYPE: &str = "execution.poll";

/// Kind of an incoming event, parsed from `event.type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A new incident was created.
    IncidentCreated,
    /// An explicit request for automatic diagnosis.
    AutoDiagnosis,
    /// A manually triggered workflow run.
    WorkflowRun,
    /// Internal continuation: resume polling a started execution.
    ExecutionPoll,
    /// Anything else; ignored without side effects.
    Other(String),
}

impl EventKind {
    /// Parses a wire event type.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "incident.created" => Self::IncidentCreated,
            "auto.diagnosis" => Self::AutoDiagnosis,
            "workflow.run" => Self::WorkflowRun,
            CONTINUATION_EVENT_TYPE => Self::ExecutionPoll,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire representation of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::IncidentCreated => "incident.created",
            Self::AutoDiagnosis => "auto.diagnosis",
            Self::WorkflowRun => "workflow.run",
            Self::ExecutionPoll => CONTINUATION_EVENT_TYPE,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Automation mode of a routed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationMode {
    /// Read-only investigation job.
    Diagnosis,
    /// State-changing repair job.
    Remediation,
}

impl AutomationMode {
    /// Parses a wire mode string, defaulting to diagnosis.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("remediation") {
            Self::Remediation
        } else {
            Self::Diagnosis
        }
    }

    /// Returns the wire representation of this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosis",
            Self::Remediation => "remediation",
        }
    }
}

impl fmt::Display for AutomationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed incident notification.
///
/// Immutable once constructed; the raw payload is retained for dotted-path
/// option building.
#[derive(Debug, Clone)]
pub struct IncidentEvent {
    /// Parsed event kind.
    pub kind: EventKind,
    /// Incident identifier (may be empty for malformed payloads).
    pub incident_id: String,
    /// Incident title.
    pub title: String,
    /// Normalized custom fields, flat `slug -> value` form.
    pub custom_fields: BTreeMap<String, String>,
    /// The full event body as received.
    pub payload: Value,
}

impl IncidentEvent {
    /// Parses an event body (the envelope after [`extract_body`]).
    #[must_use]
    pub fn from_body(body: &Value) -> Self {
        let kind = body
            .get("event")
            .and_then(|event| event.get("type"))
            .and_then(Value::as_str)
            .map(EventKind::from_wire)
            .unwrap_or(EventKind::Other(String::new()));
        let data = body.get("data");
        let incident_id = data
            .and_then(|d| d.get("id"))
            .filter(|id| !id.is_null())
            .map(|id| value_to_string(id).trim().to_string())
            .unwrap_or_default();
        let title = data
            .and_then(|d| d.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let custom_fields = data
            .and_then(|d| d.get("custom_fields"))
            .map(normalize_custom_fields)
            .unwrap_or_default();
        Self {
            kind,
            incident_id,
            title,
            custom_fields,
            payload: body.clone(),
        }
    }
}

/// Extracts the event body from a raw delivery.
///
/// Deliveries may carry the body directly, or nested under a `body` key as
/// either an object or a JSON-encoded string. Unparseable string bodies and
/// non-object deliveries collapse to an empty object.
#[must_use]
pub fn extract_body(raw: &Value) -> Value {
    let empty = Value::Object(serde_json::Map::new());
    let Some(map) = raw.as_object() else {
        return empty;
    };
    match map.get("body") {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|err| {
            tracing::warn!(error = %err, raw_len = text.len(), "event body is not valid JSON");
            empty
        }),
        Some(Value::Null) => empty,
        Some(body) => body.clone(),
        None => raw.clone(),
    }
}

/// Returns true if an extracted body is empty (nothing to do).
#[must_use]
pub fn body_is_empty(body: &Value) -> bool {
    body.as_object().is_none_or(serde_json::Map::is_empty)
}
