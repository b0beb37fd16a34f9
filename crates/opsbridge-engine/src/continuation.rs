//! Asynchronous poll continuations.
//!
//! When a continuation sink is configured, a started execution is not
//! polled inline: a self-addressed `execution.poll` event carrying the
//! execution id, mode, and selector is dispatched instead, and a later
//! invocation resumes polling out-of-band. Dispatch failure is logged by
//! the caller and never fails the triggering invocation — the execution
//! was already started and the accepted response stands.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use opsbridge_core::event::{AutomationMode, CONTINUATION_EVENT_TYPE};
use opsbridge_core::fields::value_to_string;

use crate::error::{Error, Result};

/// A self-addressed follow-up event resuming a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationEvent {
    /// Incident the report belongs to.
    pub incident_id: String,
    /// Incident title (carried for context).
    pub title: String,
    /// The execution to resume polling.
    pub execution_id: String,
    /// Automation mode of the routed job.
    pub mode: AutomationMode,
    /// Routing selector, reused for guard keys and diagnostics.
    pub selector: String,
}

impl ContinuationEvent {
    /// Renders the event as a deliverable envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        json!({
            "event": {"type": CONTINUATION_EVENT_TYPE},
            "data": {
                "id": self.incident_id,
                "title": self.title,
                "execution_id": self.execution_id,
                "mode": self.mode.as_str(),
                "selector": self.selector,
            },
        })
    }

    /// Parses continuation fields from an event body.
    ///
    /// Missing fields come back empty; the router decides whether the
    /// event is actionable. The mode defaults to diagnosis.
    #[must_use]
    pub fn from_body(body: &Value) -> Self {
        let data = body.get("data");
        let field = |name: &str| {
            data.and_then(|d| d.get(name))
                .filter(|v| !v.is_null())
                .map(|v| value_to_string(v).trim().to_string())
                .unwrap_or_default()
        };
        Self {
            incident_id: field("id"),
            title: field("title"),
            execution_id: field("execution_id"),
            mode: AutomationMode::from_wire(&field("mode")),
            selector: field("selector"),
        }
    }
}

/// Sink delivering continuation events back to the bridge.
#[async_trait]
pub trait ContinuationSink: Send + Sync {
    /// Dispatches one continuation event.
    async fn dispatch(&self, event: &ContinuationEvent) -> Result<()>;
}

/// In-memory continuation sink for testing.
///
/// Collects dispatched events for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryContinuationSink {
    events: Mutex<Vec<ContinuationEvent>>,
}

impl InMemoryContinuationSink {
    /// Creates a new, empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of dispatched events.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::continuation("continuation lock poisoned"))?;
        Ok(events.len())
    }

    /// Returns true when nothing has been dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes and returns all dispatched events.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<ContinuationEvent>> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::continuation("continuation lock poisoned"))?;
        Ok(events.drain(..).collect())
    }
}

#[async_trait]
impl ContinuationSink for InMemoryContinuationSink {
    async fn dispatch(&self, event: &ContinuationEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::continuation("continuation lock poisoned"))?;
        events.push(event.clone());
        Ok(())
    }
}

/// HTTP continuation sink: posts the envelope to the bridge's own endpoint.
pub struct HttpContinuationSink {
    http: reqwest::Client,
    url: String,
    timeout: std::time::Duration,
}

impl HttpContinuationSink {
    /// Creates a sink posting to the given endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            timeout: std::time::Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ContinuationSink for HttpContinuationSink {
    async fn dispatch(&self, event: &ContinuationEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&event.to_envelope())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::continuation(format!(
                "continuation endpoint responded {}",
                response.status(),
            )));
        }
        Ok(())
    }
}
