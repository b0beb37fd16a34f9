//! Incident-management client tests against a real local HTTP server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use opsbridge_engine::config::{IncidentConfig, MirrorConfig};
use opsbridge_engine::incident::IncidentClient;

/// Scripted behavior for the fake incident-management API.
struct IncidentFake {
    /// Statuses returned by the note endpoint, in order; last repeats.
    note_statuses: Vec<u16>,
    note_attempts: AtomicU32,
    notes: Mutex<Vec<String>>,
    /// Field id returned by discovery; empty list when `None`.
    field_id: Option<String>,
    /// Existing selection id, if any.
    selection_id: Option<String>,
    /// Status for selection create/update calls.
    selection_status: u16,
    selection_writes: Mutex<Vec<String>>,
    /// Slug returned by the field lookup.
    slug: Option<String>,
    custom_field_patches: Mutex<Vec<Value>>,
}

impl Default for IncidentFake {
    fn default() -> Self {
        Self {
            note_statuses: vec![201],
            note_attempts: AtomicU32::new(0),
            notes: Mutex::new(Vec::new()),
            field_id: Some("field-1".to_string()),
            selection_id: None,
            selection_status: 201,
            selection_writes: Mutex::new(Vec::new()),
            slug: Some("mirror_ready_token".to_string()),
            custom_field_patches: Mutex::new(Vec::new()),
        }
    }
}

async fn post_event(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let attempt = state.note_attempts.fetch_add(1, Ordering::SeqCst) as usize;
    let status = *state
        .note_statuses
        .get(attempt)
        .or(state.note_statuses.last())
        .expect("at least one note status");
    if (200..300).contains(&status) {
        let message = body["data"]["attributes"]["event"].as_str().unwrap_or_default();
        state.notes.lock().expect("lock").push(message.to_string());
    }
    (
        StatusCode::from_u16(status).expect("valid status"),
        Json(json!({"data": {"id": "evt-1"}})),
    )
}

async fn list_fields(State(state): State<Arc<IncidentFake>>) -> Json<Value> {
    let data = match &state.field_id {
        Some(id) => json!([{"id": id}]),
        None => json!([]),
    };
    Json(json!({"data": data}))
}

async fn get_field(
    State(state): State<Arc<IncidentFake>>,
    Path(_field_id): Path<String>,
) -> Json<Value> {
    Json(json!({"data": {"attributes": {"slug": state.slug.clone().unwrap_or_default()}}}))
}

async fn list_selections(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
) -> Json<Value> {
    let data = match &state.selection_id {
        Some(id) => json!([{"id": id, "attributes": {"form_field_id": "field-1"}}]),
        None => json!([]),
    };
    Json(json!({"data": data}))
}

async fn create_selection(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let value = body["data"]["attributes"]["value"].as_str().unwrap_or_default();
    state.selection_writes.lock().expect("lock").push(value.to_string());
    (
        StatusCode::from_u16(state.selection_status).expect("valid status"),
        Json(json!({"data": {"id": "sel-1"}})),
    )
}

async fn update_selection(
    State(state): State<Arc<IncidentFake>>,
    Path(_selection_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let value = body["data"]["attributes"]["value"].as_str().unwrap_or_default();
    state.selection_writes.lock().expect("lock").push(value.to_string());
    (
        StatusCode::from_u16(state.selection_status).expect("valid status"),
        Json(json!({"data": {"id": "sel-1"}})),
    )
}

async fn patch_incident(
    State(state): State<Arc<IncidentFake>>,
    Path(_incident_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.custom_field_patches.lock().expect("lock").push(body);
    Json(json!({"data": {"id": "inc-1"}}))
}

async fn serve(fake: Arc<IncidentFake>) -> String {
    let app = Router::new()
        .route("/v1/incidents/{id}/events", post(post_event))
        .route("/v1/form_fields", get(list_fields))
        .route("/v1/form_fields/{id}", get(get_field))
        .route("/v1/incidents/{id}/form_field_selections", get(list_selections).post(create_selection))
        .route("/v1/incident_form_field_selections/{id}", patch(update_selection))
        .route("/v1/incidents/{id}", patch(patch_incident))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test server");
    });
    format!("http://{addr}")
}

fn client(base_url: String) -> IncidentClient {
    client_with_mirror(base_url, MirrorConfig::default())
}

fn client_with_mirror(base_url: String, mirror: MirrorConfig) -> IncidentClient {
    let config = IncidentConfig {
        base_url,
        api_token: "test-token".to_string(),
        timeout: Duration::from_secs(5),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        mirror,
    };
    IncidentClient::new(reqwest::Client::new(), config)
}

#[tokio::test]
async fn notes_post_and_record() {
    let fake = Arc::new(IncidentFake::default());
    let base = serve(fake.clone()).await;
    client(base).post_timeline_note("inc-1", "hello timeline").await;

    let notes = fake.notes.lock().expect("lock");
    assert_eq!(notes.as_slice(), ["hello timeline"]);
}

#[tokio::test]
async fn server_errors_retry_with_backoff_then_succeed() {
    let fake = Arc::new(IncidentFake {
        note_statuses: vec![500, 201],
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;
    client(base).post_timeline_note("inc-1", "eventually lands").await;

    assert_eq!(fake.note_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(fake.notes.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn persistent_server_errors_exhaust_the_attempt_budget_without_throwing() {
    let fake = Arc::new(IncidentFake {
        note_statuses: vec![500],
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;
    // Must not panic or propagate: note posting never aborts the caller.
    client(base).post_timeline_note("inc-1", "never lands").await;

    assert_eq!(fake.note_attempts.load(Ordering::SeqCst), 3);
    assert!(fake.notes.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let fake = Arc::new(IncidentFake {
        note_statuses: vec![404],
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;
    client(base).post_timeline_note("inc-1", "rejected").await;

    assert_eq!(fake.note_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mirror_updates_an_existing_selection() {
    let fake = Arc::new(IncidentFake {
        selection_id: Some("sel-9".to_string()),
        selection_status: 200,
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;

    assert!(client(base).set_mirror_ready("inc-1", "exec-7").await);
    let writes = fake.selection_writes.lock().expect("lock");
    assert_eq!(writes.len(), 1);
    assert!(writes[0].starts_with("mrr_"));
    assert!(writes[0].ends_with("_exec-7"));
}

#[tokio::test]
async fn mirror_creates_a_selection_when_none_exists() {
    let fake = Arc::new(IncidentFake::default());
    let base = serve(fake.clone()).await;

    assert!(client(base).set_mirror_ready("inc-1", "").await);
    assert_eq!(fake.selection_writes.lock().expect("lock").len(), 1);
    assert!(fake.custom_field_patches.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn mirror_falls_back_to_the_custom_field_patch() {
    let fake = Arc::new(IncidentFake {
        selection_status: 422,
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;

    assert!(client(base).set_mirror_ready("inc-1", "exec-7").await);
    let patches = fake.custom_field_patches.lock().expect("lock");
    assert_eq!(patches.len(), 1);
    let token = patches[0]["data"]["attributes"]["custom_fields"]["mirror_ready_token"]
        .as_str()
        .expect("token in patch");
    assert!(token.starts_with("mrr_"));
}

#[tokio::test]
async fn mirror_aborts_with_a_warning_note_when_no_field_exists() {
    let fake = Arc::new(IncidentFake {
        field_id: None,
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;

    assert!(!client(base).set_mirror_ready("inc-1", "").await);
    let notes = fake.notes.lock().expect("lock");
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("custom field id could not be determined"));
}

#[tokio::test]
async fn configured_field_id_skips_discovery() {
    let fake = Arc::new(IncidentFake {
        // Discovery would fail, but the configured id bypasses it.
        field_id: None,
        ..IncidentFake::default()
    });
    let base = serve(fake.clone()).await;
    let mirror = MirrorConfig {
        field_id: Some("field-1".to_string()),
        ..MirrorConfig::default()
    };

    assert!(client_with_mirror(base, mirror).set_mirror_ready("inc-1", "").await);
    assert_eq!(fake.selection_writes.lock().expect("lock").len(), 1);
}
