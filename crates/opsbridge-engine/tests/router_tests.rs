//! End-to-end router tests: real local HTTP collaborators, in-memory
//! guard store, in-memory continuation sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use opsbridge_engine::config::EngineConfig;
use opsbridge_engine::continuation::{ContinuationSink, InMemoryContinuationSink};
use opsbridge_engine::guard::memory::InMemoryGuardStore;
use opsbridge_engine::router::EventRouter;

// --- Fake incident-management API ---

#[derive(Default)]
struct IncidentFake {
    notes: Mutex<Vec<String>>,
    mirror_writes: Mutex<Vec<String>>,
}

async fn post_event(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let message = body["data"]["attributes"]["event"].as_str().unwrap_or_default();
    state.notes.lock().expect("lock").push(message.to_string());
    (StatusCode::CREATED, Json(json!({"data": {"id": "evt-1"}})))
}

async fn list_fields() -> Json<Value> {
    Json(json!({"data": [{"id": "field-1"}]}))
}

async fn list_selections(Path(_incident_id): Path<String>) -> Json<Value> {
    Json(json!({"data": []}))
}

async fn create_selection(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let value = body["data"]["attributes"]["value"].as_str().unwrap_or_default();
    state.mirror_writes.lock().expect("lock").push(value.to_string());
    (StatusCode::CREATED, Json(json!({"data": {"id": "sel-1"}})))
}

async fn serve_incident(fake: Arc<IncidentFake>) -> String {
    let app = Router::new()
        .route("/v1/incidents/{id}/events", post(post_event))
        .route("/v1/form_fields", get(list_fields))
        .route(
            "/v1/incidents/{id}/form_field_selections",
            get(list_selections).post(create_selection),
        )
        .with_state(fake);
    serve(app).await
}

// --- Fake job-runner API ---

struct RunnerFake {
    start_status: StatusCode,
    start_body: String,
    starts: AtomicU32,
    final_state: String,
    output_entries: Vec<&'static str>,
}

impl Default for RunnerFake {
    fn default() -> Self {
        Self {
            start_status: StatusCode::OK,
            start_body: r#"{"id": 42}"#.to_string(),
            starts: AtomicU32::new(0),
            final_state: "succeeded".to_string(),
            output_entries: vec!["A", "A", "---", "B", "B"],
        }
    }
}

async fn start_job(
    State(state): State<Arc<RunnerFake>>,
    Path(_job_id): Path<String>,
    Json(_payload): Json<Value>,
) -> (StatusCode, String) {
    state.starts.fetch_add(1, Ordering::SeqCst);
    (state.start_status, state.start_body.clone())
}

async fn execution_state(
    State(state): State<Arc<RunnerFake>>,
    Path(_execution_id): Path<String>,
) -> Json<Value> {
    Json(json!({"completed": true, "executionState": state.final_state}))
}

async fn execution_output(
    State(state): State<Arc<RunnerFake>>,
    Path(_execution_id): Path<String>,
) -> Json<Value> {
    let entries: Vec<Value> = state
        .output_entries
        .iter()
        .map(|line| json!({"log": line}))
        .collect();
    Json(json!({"entries": entries}))
}

async fn serve_runner(fake: Arc<RunnerFake>) -> String {
    let app = Router::new()
        .route("/job/{id}/run", post(start_job))
        .route("/execution/{id}/state", get(execution_state))
        .route("/execution/{id}/output", get(execution_output))
        .with_state(fake);
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test server");
    });
    format!("http://{addr}")
}

// --- Harness ---

struct Harness {
    router: EventRouter,
    incident: Arc<IncidentFake>,
    runner: Arc<RunnerFake>,
    continuations: Option<Arc<InMemoryContinuationSink>>,
}

impl Harness {
    async fn new(runner: RunnerFake, with_continuations: bool) -> Self {
        let incident = Arc::new(IncidentFake::default());
        let runner = Arc::new(runner);
        let incident_url = serve_incident(incident.clone()).await;
        let runner_url = serve_runner(runner.clone()).await;

        let mut config = EngineConfig::default();
        config.incident.base_url = incident_url;
        config.incident.api_token = "incident-token".to_string();
        config.incident.retry_backoff = Duration::from_millis(1);
        config.runner.base_url = runner_url;
        config.runner.api_token = "runner-token".to_string();
        config.runner.poll_interval = Duration::from_millis(1);
        config.runner.max_poll_attempts = 3;
        config
            .routing
            .watch_to_diagnosis
            .insert("disk_pressure".to_string(), "job-9".to_string());
        config
            .routing
            .remediation_jobs
            .insert("restart_pool".to_string(), "job-7".to_string());

        let continuations = with_continuations.then(|| Arc::new(InMemoryContinuationSink::new()));
        let sink = continuations
            .clone()
            .map(|sink| sink as Arc<dyn ContinuationSink>);
        let router = EventRouter::new(
            config,
            reqwest::Client::new(),
            Arc::new(InMemoryGuardStore::new()),
            sink,
        );
        Self {
            router,
            incident,
            runner,
            continuations,
        }
    }

    fn notes(&self) -> Vec<String> {
        self.incident.notes.lock().expect("lock").clone()
    }

    fn mirror_writes(&self) -> Vec<String> {
        self.incident.mirror_writes.lock().expect("lock").clone()
    }

    fn starts(&self) -> u32 {
        self.runner.starts.load(Ordering::SeqCst)
    }
}

fn auto_event(watch: &str) -> Value {
    json!({
        "event": {"type": "incident.created"},
        "data": {
            "id": "inc-1",
            "title": "Disk pressure on prod",
            "custom_fields": {
                "watch_id": watch,
                "environment_orn": "orn:env:prod-eu",
            },
        },
    })
}

fn manual_event(selection: &str) -> Value {
    json!({
        "event": {"type": "workflow.run"},
        "data": {
            "id": "inc-1",
            "title": "Disk pressure on prod",
            "custom_fields": {
                "remediation_job": selection,
                "environment_orn": "orn:env:prod-eu",
                "asset": "pool-7",
            },
        },
    })
}

#[tokio::test]
async fn unknown_manual_selection_notes_and_mirrors_exactly_once() {
    let harness = Harness::new(RunnerFake::default(), false).await;
    let event = manual_event("Does Not Exist");

    let first = harness.router.handle(&event).await;
    assert_eq!(first.status_code, 200);
    assert_eq!(first.status(), "job_not_found_but_mirrored");

    // Second delivery inside the dedupe window is suppressed.
    let second = harness.router.handle(&event).await;
    assert_eq!(second.status(), "job_not_found_but_mirrored");

    let notes = harness.notes();
    assert_eq!(notes.len(), 1, "exactly one guidance note: {notes:?}");
    assert!(notes[0].contains("Unknown manual job selection 'does_not_exist'"));
    assert_eq!(harness.mirror_writes().len(), 1, "exactly one mirror write");
    assert_eq!(harness.starts(), 0);
}

#[tokio::test]
async fn auto_diagnosis_runs_inline_and_posts_the_normalized_report() {
    let harness = Harness::new(RunnerFake::default(), false).await;

    let response = harness.router.handle(&auto_event("Disk Pressure")).await;
    assert_eq!(response.status(), "diagnosis_posted");
    assert_eq!(harness.starts(), 1);

    let notes = harness.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("(auto)"));
    assert!(notes[0].contains("_Selector: auto:watch:disk_pressure_"));
    assert!(notes[0].contains("A\n\nB"), "normalized output in note: {:?}", notes[0]);
    assert_eq!(harness.mirror_writes().len(), 1);

    // A duplicate delivery collides on the auto gate.
    let duplicate = harness.router.handle(&auto_event("Disk Pressure")).await;
    assert_eq!(duplicate.status(), "auto_already_processed_recently");
    assert_eq!(harness.starts(), 1);
    assert_eq!(harness.notes().len(), 1);
}

#[tokio::test]
async fn unknown_watch_key_posts_guidance_and_stops() {
    let harness = Harness::new(RunnerFake::default(), false).await;

    let response = harness.router.handle(&auto_event("Unknown Watch")).await;
    assert_eq!(response.status(), "auto_skip_unknown_watch");
    assert_eq!(harness.starts(), 0);

    let notes = harness.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("unknown_watch"));
    assert_eq!(harness.mirror_writes().len(), 1);
}

#[tokio::test]
async fn start_rejection_is_classified_and_still_a_200() {
    let harness = Harness::new(
        RunnerFake {
            start_status: StatusCode::BAD_REQUEST,
            start_body: r#"{"error": true, "message": "option bad_opt does not exist"}"#
                .to_string(),
            ..RunnerFake::default()
        },
        false,
    )
    .await;

    let response = harness.router.handle(&auto_event("Disk Pressure")).await;
    assert_eq!(response.status_code, 200, "business failures never 500");
    assert_eq!(response.status(), "runner_start_validation_error");

    let notes = harness.notes();
    assert!(
        notes.iter().any(|note| note.contains("ROUTING::RUNNER_API_ERROR")),
        "classified routing signal posted: {notes:?}",
    );
    assert!(
        notes.iter().any(|note| note.contains("bad_opt")),
        "human note carries the raw body: {notes:?}",
    );
    assert_eq!(harness.mirror_writes().len(), 1);
}

#[tokio::test]
async fn preflight_blocks_auto_diagnosis_with_blank_required_options() {
    let harness = Harness::new(RunnerFake::default(), false).await;
    let event = json!({
        "event": {"type": "auto.diagnosis"},
        "data": {
            "id": "inc-1",
            "title": "Disk pressure on prod",
            // No environment_orn: the required env_orn option stays blank.
            "custom_fields": {"watch_id": "Disk Pressure"},
        },
    });

    let response = harness.router.handle(&event).await;
    assert_eq!(response.status(), "preflight_validation_error");
    assert_eq!(harness.starts(), 0, "no start call after preflight failure");

    let notes = harness.notes();
    assert_eq!(notes.len(), 1);
    assert!(
        notes[0].contains("Missing required options for auto diagnosis: env_orn"),
        "missing names verbatim in guidance: {:?}",
        notes[0],
    );
    assert_eq!(harness.mirror_writes().len(), 1);
}

#[tokio::test]
async fn manual_remediation_resolves_against_the_remediation_map() {
    let harness = Harness::new(RunnerFake::default(), false).await;

    let response = harness.router.handle(&manual_event("Restart Pool")).await;
    assert_eq!(response.status(), "remediation_posted");
    assert_eq!(harness.starts(), 1);

    // Retried delivery collides on the selector guard.
    let duplicate = harness.router.handle(&manual_event("Restart Pool")).await;
    assert_eq!(duplicate.status(), "ignored_duplicate");
    assert_eq!(harness.starts(), 1);
}

#[tokio::test]
async fn continuation_sink_defers_polling_out_of_band() {
    let harness = Harness::new(RunnerFake::default(), true).await;

    let response = harness.router.handle(&auto_event("Disk Pressure")).await;
    assert_eq!(response.status(), "accepted");
    assert_eq!(harness.notes().len(), 0, "no report yet: polling deferred");

    let sink = harness.continuations.as_ref().expect("sink");
    let dispatched = sink.drain().expect("drain");
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].execution_id, "42");
    assert_eq!(dispatched[0].selector, "auto:watch:disk_pressure");

    // Feed the continuation back through the router: the poll path resumes
    // without re-running routing.
    let follow_up = harness.router.handle(&dispatched[0].to_envelope()).await;
    assert_eq!(follow_up.status(), "poll_posted");
    assert_eq!(harness.starts(), 1, "continuation never restarts the job");

    let notes = harness.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("A\n\nB"));
    assert_eq!(harness.mirror_writes().len(), 1);
}

#[tokio::test]
async fn failed_execution_inline_is_reported_and_mirrored() {
    let harness = Harness::new(
        RunnerFake {
            final_state: "failed".to_string(),
            ..RunnerFake::default()
        },
        false,
    )
    .await;

    let response = harness.router.handle(&auto_event("Disk Pressure")).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.status(), "poll_failed_but_mirrored");

    let notes = harness.notes();
    assert!(
        notes.iter().any(|note| note.contains("terminal state 'failed'")),
        "failure details in note: {notes:?}",
    );
    assert!(
        notes.iter().any(|note| note.contains("ROUTING::UNKNOWN_FAILURE")),
        "routing signal posted: {notes:?}",
    );
    assert_eq!(harness.mirror_writes().len(), 1);
}
