//! Top-level event routing.
//!
//! One invocation handles exactly one event, sequentially: route, guard,
//! build options, start, await (inline or via continuation), write back.
//! Cross-invocation races — duplicate deliveries, a start racing its own
//! continuation — are all resolved by the idempotency guard.
//!
//! Business failures never bubble out as 5xx: routing misses, start
//! rejections, and poll timeouts each end with exactly one guidance note
//! (guard-deduped), one mirror/ready signal, and a 200 response with a
//! descriptive status, so the upstream delivery system does not retry and
//! downstream waiters are never left hanging. Only an unhandled internal
//! fault yields a 500 — and even then a best-effort note and mirror are
//! attempted first.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Instrument;

use opsbridge_core::event::{
    AutomationMode, EventKind, IncidentEvent, body_is_empty, extract_body,
};
use opsbridge_core::failure::classify_failure;
use opsbridge_core::fields::{normalize_key, resolve};
use opsbridge_core::observability::invocation_span;
use opsbridge_core::options::build_options;

use crate::config::EngineConfig;
use crate::continuation::{ContinuationEvent, ContinuationSink};
use crate::error::{Error, Result};
use crate::guard::{GuardStore, IdempotencyGuard};
use crate::incident::IncidentClient;
use crate::metrics::EngineMetrics;
use crate::orchestrator::{Execution, Orchestrator};
use crate::report::{format_failure, format_report};
use crate::response::HandlerResponse;
use crate::runner::RunnerClient;

/// The routing decision produced for one actionable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Automation mode of the selected job.
    pub mode: AutomationMode,
    /// Job id to start on the remote runner.
    pub job_id: String,
    /// Deterministic selector: retried deliveries of the same decision
    /// collide on the same guard key. Also used for diagnostics.
    pub selector: String,
    /// Whether the job was selected automatically.
    pub auto: bool,
}

/// Routes incoming events to job executions and write-backs.
pub struct EventRouter {
    config: EngineConfig,
    incident: Arc<IncidentClient>,
    orchestrator: Orchestrator,
    guard: IdempotencyGuard,
    continuations: Option<Arc<dyn ContinuationSink>>,
    metrics: EngineMetrics,
}

impl EventRouter {
    /// Builds a router for one invocation from a configuration snapshot.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        http: reqwest::Client,
        store: Arc<dyn GuardStore>,
        continuations: Option<Arc<dyn ContinuationSink>>,
    ) -> Self {
        let incident = Arc::new(IncidentClient::new(http.clone(), config.incident.clone()));
        let runner = Arc::new(RunnerClient::new(http, config.runner.clone()));
        let orchestrator = Orchestrator::new(runner);
        let guard = IdempotencyGuard::new(store, config.guard.fail_policy);
        Self {
            config,
            incident,
            orchestrator,
            guard,
            continuations,
            metrics: EngineMetrics::new(),
        }
    }

    /// Handles one raw event delivery.
    ///
    /// Never returns an error: internal faults run the best-effort
    /// finalizer and come back as a 500 response.
    pub async fn handle(&self, raw: &Value) -> HandlerResponse {
        let body = extract_body(raw);
        if body_is_empty(&body) {
            tracing::warn!("empty event body; nothing to do");
            return HandlerResponse::ok("ignored_empty_body");
        }

        let event = IncidentEvent::from_body(&body);
        let span = invocation_span(event.kind.as_str(), &event.incident_id);
        let response = match self.dispatch(&event, &body).instrument(span).await {
            Ok(response) => response,
            Err(err) => self.finalize_internal_fault(&event, &err).await,
        };
        self.metrics.record_event(event.kind.as_str(), response.status());
        response
    }

    async fn dispatch(&self, event: &IncidentEvent, body: &Value) -> Result<HandlerResponse> {
        if event.kind == EventKind::ExecutionPoll {
            return Ok(self.handle_continuation(body).await);
        }

        if resolve(body, "data.id").is_none() {
            tracing::warn!("payload validation failed: missing data.id");
            return Ok(HandlerResponse::ok("ignored_invalid_payload").with("reason", "missing data.id"));
        }
        if event.incident_id.is_empty() {
            tracing::warn!("blank incident id; ignoring");
            return Ok(HandlerResponse::ok("ignored_missing_incident_id"));
        }

        match &event.kind {
            EventKind::IncidentCreated | EventKind::AutoDiagnosis => {
                self.handle_auto(event, body).await
            }
            EventKind::WorkflowRun => self.handle_manual(event, body).await,
            EventKind::Other(raw) => {
                let shown = if raw.is_empty() { "(none)" } else { raw.as_str() };
                tracing::info!(event_type = shown, "ignored event");
                Ok(HandlerResponse::ok("ignored_event").with("event_type", shown))
            }
            EventKind::ExecutionPoll => unreachable!("handled above"),
        }
    }

    /// Auto routing: look up the normalized watch key in the watch→job map.
    async fn handle_auto(&self, event: &IncidentEvent, body: &Value) -> Result<HandlerResponse> {
        let incident_id = &event.incident_id;
        let watch_raw = event
            .custom_fields
            .get(&self.config.routing.watch_field)
            .map(|v| v.trim())
            .unwrap_or_default();
        let watch_key = if watch_raw.is_empty() { String::new() } else { normalize_key(watch_raw) };

        let job_id = self.config.routing.watch_to_diagnosis.get(&watch_key);
        let Some(job_id) = job_id else {
            let shown = if watch_key.is_empty() { "(none)".to_string() } else { watch_key.clone() };
            tracing::info!(watch_key = %shown, "auto diagnosis skipped: unknown or missing watch key");
            let message = format!(
                "Unrecognized or missing `{}` for auto diagnosis. Received: '{shown}'. \
                 You can run a job manually via the workflow form after filling required inputs.",
                self.config.routing.watch_field,
            );
            let selector = format!(
                "auto:watch:{}",
                if watch_key.is_empty() { "none" } else { watch_key.as_str() },
            );
            let formatted = format_failure(&message, true, &selector);
            self.note_once(
                incident_id,
                "auto_skip_unknown_watch",
                &formatted,
                self.config.guard.auto_dedupe_ttl,
            )
            .await;
            self.mirror_once(incident_id, "auto_skip_unknown_watch", "auto_skip_unknown_watch")
                .await;
            return Ok(HandlerResponse::ok("auto_skip_unknown_watch")
                .with("incident_id", incident_id.as_str())
                .with("watch_id", shown));
        };

        if !self
            .guard
            .acquire(
                incident_id,
                &format!("gate:auto:{watch_key}"),
                self.config.guard.auto_dedupe_ttl,
            )
            .await
        {
            return Ok(HandlerResponse::ok("auto_already_processed_recently")
                .with("incident_id", incident_id.as_str()));
        }

        let decision = RoutingDecision {
            mode: AutomationMode::Diagnosis,
            job_id: job_id.clone(),
            selector: format!("auto:watch:{watch_key}"),
            auto: true,
        };
        tracing::info!(watch_key = %watch_key, job_id = %decision.job_id, "auto diagnosis selected");
        self.run_decision(event, body, decision).await
    }

    /// Manual routing: resolve the selected job key against the
    /// remediation map, then the diagnosis map.
    async fn handle_manual(&self, event: &IncidentEvent, body: &Value) -> Result<HandlerResponse> {
        let incident_id = &event.incident_id;
        let manual_raw = event
            .custom_fields
            .get(&self.config.routing.remediation_field)
            .or_else(|| event.custom_fields.get(&self.config.routing.diagnosis_field))
            .map(|v| v.trim())
            .unwrap_or_default();
        if manual_raw.is_empty() {
            tracing::info!(incident_id = %incident_id, "no manual job selection; ignoring cleanly");
            return Ok(HandlerResponse::ok("ignored_empty_or_missing")
                .with("incident_id", incident_id.as_str()));
        }
        let manual_key = normalize_key(manual_raw);
        tracing::info!(raw = %manual_raw, normalized = %manual_key, "manual job selection parsed");

        let (mode, job_id) = if let Some(job) = self.config.routing.remediation_jobs.get(&manual_key)
        {
            (AutomationMode::Remediation, job.clone())
        } else if let Some(job) = self.config.routing.diagnosis_jobs.get(&manual_key) {
            (AutomationMode::Diagnosis, job.clone())
        } else {
            tracing::warn!(job_key = %manual_key, "manual job key not found");
            let message = format!("Unknown manual job selection '{manual_key}'.");
            let formatted = format_failure(&message, false, "");
            self.note_once(
                incident_id,
                "unknown_job_key",
                &formatted,
                self.config.guard.auto_dedupe_ttl,
            )
            .await;
            self.mirror_once(incident_id, "unknown_job", "unknown_job").await;
            return Ok(HandlerResponse::ok("job_not_found_but_mirrored")
                .with("incident_id", incident_id.as_str())
                .with("job_key", manual_key));
        };

        let decision = RoutingDecision {
            selector: format!("manual:{mode}:{manual_key}"),
            mode,
            job_id,
            auto: false,
        };
        tracing::info!(mode = %decision.mode, job_id = %decision.job_id, selector = %decision.selector, "manual job resolved");
        self.run_decision(event, body, decision).await
    }

    /// Gates, prepares, starts, and awaits (or defers) one routed job.
    async fn run_decision(
        &self,
        event: &IncidentEvent,
        body: &Value,
        decision: RoutingDecision,
    ) -> Result<HandlerResponse> {
        let incident_id = &event.incident_id;
        if decision.job_id.is_empty() {
            tracing::warn!(selector = %decision.selector, "no job id after routing");
            return Ok(HandlerResponse::ok("no_job_routed").with("incident_id", incident_id.as_str()));
        }

        let trigger_ttl = self.note_ttl(decision.auto);
        if !self.guard.acquire(incident_id, &decision.selector, trigger_ttl).await {
            return Ok(HandlerResponse::ok("ignored_duplicate")
                .with("incident_id", incident_id.as_str())
                .with("guard_key", decision.selector.as_str())
                .with("mode", decision.mode.as_str()));
        }

        let options = match build_options(body, decision.mode, &self.config.options) {
            Ok(options) => options,
            Err(err) => {
                tracing::error!(error = %err, "option build failed");
                let formatted = format_failure(
                    &format!("options build failure: {err}"),
                    decision.auto,
                    &decision.selector,
                );
                self.note_once(incident_id, "options_build_error", &formatted, trigger_ttl)
                    .await;
                self.mirror_once(incident_id, "options_build_error", "options_build_error")
                    .await;
                return Ok(HandlerResponse::ok("options_build_error")
                    .with("incident_id", incident_id.as_str())
                    .with("mode", decision.mode.as_str()));
            }
        };
        tracing::info!(count = options.len(), mode = %decision.mode, "job options built");

        // Preflight applies to automatically selected diagnosis only.
        if decision.auto && decision.mode == AutomationMode::Diagnosis {
            let missing: Vec<String> = self
                .config
                .required_auto_options
                .iter()
                .filter(|name| {
                    options.get(*name).map(|v| v.trim().is_empty()).unwrap_or(true)
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                let joined = missing.join(", ");
                tracing::warn!(missing = %joined, selector = %decision.selector, "preflight missing options");
                let guidance = format!("Missing required options for auto diagnosis: {joined}");
                let formatted = format_failure(&guidance, true, &decision.selector);
                self.note_once(
                    incident_id,
                    "preflight_missing_options",
                    &formatted,
                    self.config.guard.auto_dedupe_ttl,
                )
                .await;
                let tagged = missing.join("_");
                let selector_part = if decision.selector.is_empty() {
                    "_"
                } else {
                    decision.selector.as_str()
                };
                self.mirror_once(
                    incident_id,
                    &format!("preflight:{}:{selector_part}:{tagged}", decision.mode),
                    &format!("preflight_missing_{}_{tagged}", decision.mode),
                )
                .await;
                return Ok(HandlerResponse::ok("preflight_validation_error")
                    .with("incident_id", incident_id.as_str())
                    .with("mode", decision.mode.as_str())
                    .with("missing", missing));
            }
        }

        let execution = match self.orchestrator.start(&decision.job_id, &options).await {
            Ok(execution) => execution,
            Err(err) => return self.finalize_start_failure(event, &decision, err).await,
        };
        tracing::info!(execution_id = %execution.id, selector = %decision.selector, "execution started");

        if self.continuations.is_some() {
            return Ok(self.defer_poll(event, &decision, &execution).await);
        }
        Ok(self.await_inline(event, &decision, execution).await)
    }

    /// Deferred path: hand polling off to a self-dispatched continuation.
    async fn defer_poll(
        &self,
        event: &IncidentEvent,
        decision: &RoutingDecision,
        execution: &Execution,
    ) -> HandlerResponse {
        let continuation = ContinuationEvent {
            incident_id: event.incident_id.clone(),
            title: event.title.clone(),
            execution_id: execution.id.clone(),
            mode: decision.mode,
            selector: decision.selector.clone(),
        };
        if let Some(sink) = &self.continuations {
            match sink.dispatch(&continuation).await {
                Ok(()) => tracing::info!(execution_id = %execution.id, "poll continuation dispatched"),
                Err(err) => {
                    tracing::warn!(error = %err, "continuation dispatch failed (non-blocking)");
                }
            }
        }
        HandlerResponse::ok("accepted")
            .with("incident_id", event.incident_id.as_str())
            .with("execution_id", execution.id.as_str())
            .with("mode", decision.mode.as_str())
    }

    /// Inline path: block on poll → fetch → normalize → write back.
    async fn await_inline(
        &self,
        event: &IncidentEvent,
        decision: &RoutingDecision,
        mut execution: Execution,
    ) -> HandlerResponse {
        tracing::warn!("no continuation sink configured; polling inline (blocking)");
        let incident_id = &event.incident_id;
        match self.orchestrator.await_output(&mut execution, true).await {
            Ok(text) => {
                let formatted =
                    format_report(&text, decision.selector.contains("auto:"), &decision.selector);
                self.incident.post_timeline_note(incident_id, &formatted).await;
                self.mirror_once(incident_id, &format!("inline:{}", execution.id), &execution.id)
                    .await;
                HandlerResponse::ok(format!("{}_posted", decision.mode))
                    .with("incident_id", incident_id.as_str())
            }
            Err(err) => {
                let err_text = err.to_string();
                tracing::error!(error = %err_text, selector = %decision.selector, "inline poll/post error");
                let formatted = format_failure(&err_text, decision.auto, &decision.selector);
                self.note_once(
                    incident_id,
                    "inline_poll_error",
                    &formatted,
                    self.config.guard.auto_dedupe_ttl,
                )
                .await;
                self.post_routing_signal(incident_id, &err_text).await;
                let scope_tail = if decision.selector.is_empty() {
                    if execution.id.is_empty() { "inline" } else { execution.id.as_str() }
                } else {
                    decision.selector.as_str()
                };
                self.mirror_once(
                    incident_id,
                    &format!("inline_err:{}:{scope_tail}", decision.mode),
                    &format!("inline_poll_error_{}", decision.mode),
                )
                .await;
                HandlerResponse::ok("poll_failed_but_mirrored")
                    .with("incident_id", incident_id.as_str())
                    .with("error", err_text)
                    .with("mode", decision.mode.as_str())
            }
        }
    }

    /// Continuation path: resume polling for a previously started
    /// execution. Never re-runs routing.
    async fn handle_continuation(&self, body: &Value) -> HandlerResponse {
        let continuation = ContinuationEvent::from_body(body);
        let incident_id = continuation.incident_id.clone();
        let execution_id = continuation.execution_id.clone();
        if incident_id.is_empty() || execution_id.is_empty() {
            tracing::warn!(
                incident_id = %incident_id,
                execution_id = %execution_id,
                "poll continuation missing inputs",
            );
            return HandlerResponse::ok("ignored_poll_missing_inputs");
        }

        let auto = continuation.selector.contains("auto:");
        let mut execution = Execution::resumed(execution_id.clone());
        match self.orchestrator.await_output(&mut execution, false).await {
            Ok(text) => {
                let formatted = format_report(&text, auto, &continuation.selector);
                self.incident.post_timeline_note(&incident_id, &formatted).await;
                self.mirror_once(&incident_id, &format!("poll:{execution_id}"), &execution_id)
                    .await;
                HandlerResponse::ok("poll_posted")
                    .with("incident_id", incident_id)
                    .with("execution_id", execution_id)
                    .with("mode", continuation.mode.as_str())
            }
            Err(err) => {
                let err_text = err.to_string();
                tracing::error!(
                    error = %err_text,
                    execution_id = %execution_id,
                    incident_id = %incident_id,
                    "poll continuation failed",
                );
                let formatted = format_failure(&err_text, auto, &continuation.selector);
                self.note_once(
                    &incident_id,
                    "poll_error",
                    &formatted,
                    self.config.guard.auto_dedupe_ttl,
                )
                .await;
                self.post_routing_signal(&incident_id, &err_text).await;
                let scope_tail = if continuation.selector.is_empty() {
                    execution_id.as_str()
                } else {
                    continuation.selector.as_str()
                };
                self.mirror_once(
                    &incident_id,
                    &format!("poll_err:{}:{scope_tail}", continuation.mode),
                    &format!("poll_error_{}", continuation.mode),
                )
                .await;
                HandlerResponse::ok("poll_failed_but_mirrored")
                    .with("incident_id", incident_id)
                    .with("error", err_text)
                    .with("mode", continuation.mode.as_str())
            }
        }
    }

    /// Start-failure path: classified note + mirror, 200 response.
    async fn finalize_start_failure(
        &self,
        event: &IncidentEvent,
        decision: &RoutingDecision,
        err: Error,
    ) -> Result<HandlerResponse> {
        let Error::StartRejected { status, body: detail } = &err else {
            // Transport and other infrastructure errors take the
            // unhandled-fault path.
            return Err(err);
        };
        let incident_id = &event.incident_id;
        let err_text = err.to_string();
        tracing::error!(
            status = *status,
            selector = %decision.selector,
            body = %detail.chars().take(400).collect::<String>(),
            "job start failed",
        );

        let guidance = if detail.is_empty() {
            format!("HTTP {status}: (no body)")
        } else {
            detail.clone()
        };
        let formatted = format_failure(&guidance, decision.auto, &decision.selector);
        self.note_once(
            incident_id,
            &format!("runner_start_{status}"),
            &formatted,
            self.note_ttl(decision.auto),
        )
        .await;
        self.post_routing_signal(incident_id, &err_text).await;
        let selector_part = if decision.selector.is_empty() {
            "_"
        } else {
            decision.selector.as_str()
        };
        self.mirror_once(
            incident_id,
            &format!("start:{}:{selector_part}:{status}", decision.mode),
            &format!("start_{}_{status}", decision.mode),
        )
        .await;
        Ok(HandlerResponse::ok("runner_start_validation_error")
            .with("incident_id", incident_id.as_str())
            .with("mode", decision.mode.as_str()))
    }

    /// Best-effort finalizer for unhandled internal faults: note + mirror,
    /// swallowing secondary failures, then a 500 response.
    async fn finalize_internal_fault(&self, event: &IncidentEvent, err: &Error) -> HandlerResponse {
        let err_text = err.to_string();
        tracing::error!(error = %err_text, "unhandled engine fault");
        let incident_id = &event.incident_id;
        if !incident_id.is_empty() {
            let formatted = format_failure(&err_text, false, "");
            self.note_once(
                incident_id,
                "handler_error",
                &formatted,
                self.config.guard.auto_dedupe_ttl,
            )
            .await;
            self.mirror_once(incident_id, "handler_error", "handler_error").await;
        }
        HandlerResponse::internal_error("exception").with("error", err_text)
    }

    /// Posts the machine-readable failure-category signal.
    async fn post_routing_signal(&self, incident_id: &str, err_text: &str) {
        let category = classify_failure(err_text);
        self.incident
            .post_timeline_note(incident_id, &category.routing_signal())
            .await;
    }

    /// Dedupe window for notes and trigger guards: the auto window for
    /// automatic routing, the short trigger window otherwise.
    fn note_ttl(&self, auto: bool) -> Duration {
        if auto {
            self.config.guard.auto_dedupe_ttl
        } else {
            self.config.guard.trigger_ttl
        }
    }

    /// Posts a note at most once per `(incident, purpose)` inside the TTL
    /// window.
    async fn note_once(
        &self,
        incident_id: &str,
        purpose: &str,
        message: &str,
        ttl: Duration,
    ) -> bool {
        if self.guard.acquire(incident_id, &format!("note:{purpose}"), ttl).await {
            self.incident.post_timeline_note(incident_id, message).await;
            true
        } else {
            tracing::info!(purpose = %purpose, "note suppressed by guard");
            false
        }
    }

    /// Writes the mirror/ready signal at most once per scope inside the
    /// mirror dedupe window.
    async fn mirror_once(&self, incident_id: &str, scope: &str, tag: &str) -> bool {
        if self
            .guard
            .acquire(
                incident_id,
                &format!("mirror:{scope}"),
                self.config.guard.mirror_dedupe_ttl,
            )
            .await
        {
            self.incident.set_mirror_ready(incident_id, tag).await
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::memory::InMemoryGuardStore;
    use serde_json::json;

    fn router() -> EventRouter {
        EventRouter::new(
            EngineConfig::default(),
            reqwest::Client::new(),
            Arc::new(InMemoryGuardStore::new()),
            None,
        )
    }

    #[tokio::test]
    async fn empty_body_is_acknowledged_and_ignored() {
        let response = router().handle(&json!({"body": "{broken"})).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status(), "ignored_empty_body");
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored() {
        let response = router()
            .handle(&json!({
                "event": {"type": "incident.closed"},
                "data": {"id": "inc-1"},
            }))
            .await;
        assert_eq!(response.status(), "ignored_event");
    }

    #[tokio::test]
    async fn missing_incident_id_is_rejected_cleanly() {
        let response = router()
            .handle(&json!({
                "event": {"type": "workflow.run"},
                "data": {"title": "no id"},
            }))
            .await;
        assert_eq!(response.status(), "ignored_invalid_payload");

        let response = router()
            .handle(&json!({
                "event": {"type": "workflow.run"},
                "data": {"id": "   "},
            }))
            .await;
        assert_eq!(response.status(), "ignored_missing_incident_id");
    }

    #[tokio::test]
    async fn continuation_without_inputs_is_ignored() {
        let response = router()
            .handle(&json!({
                "event": {"type": "execution.poll"},
                "data": {"id": "inc-1"},
            }))
            .await;
        assert_eq!(response.status(), "ignored_poll_missing_inputs");
    }
}
