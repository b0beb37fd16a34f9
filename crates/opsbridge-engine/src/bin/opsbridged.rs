//! opsbridge event-bridge service.
//!
//! Thin HTTP wiring around the engine: `POST /events` feeds one event
//! through the router, `GET /healthz` answers liveness probes. All
//! behavior lives in `opsbridge-engine`; this binary only loads
//! configuration, installs observability, and serves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tokio::sync::Mutex;

use opsbridge_core::observability::{LogFormat, init_logging};
use opsbridge_engine::config::{CachedConfig, EngineConfig, HttpSnapshotSource, SnapshotSource};
use opsbridge_engine::continuation::{ContinuationSink, HttpContinuationSink};
use opsbridge_engine::guard::GuardStore;
use opsbridge_engine::guard::memory::InMemoryGuardStore;
use opsbridge_engine::response::ResponseBody;
use opsbridge_engine::router::EventRouter;

struct AppState {
    http: reqwest::Client,
    store: Arc<dyn GuardStore>,
    cached: Mutex<CachedConfig>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    continuations: Option<Arc<dyn ContinuationSink>>,
}

async fn handle_event(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Value>,
) -> (StatusCode, Json<ResponseBody>) {
    // Each invocation takes its own configuration snapshot, refreshed
    // lazily at the start.
    let config = {
        let mut cached = state.cached.lock().await;
        if let Some(source) = &state.snapshot {
            cached.refresh(source.as_ref()).await;
        }
        cached.snapshot()
    };

    let router = EventRouter::new(
        config,
        state.http.clone(),
        state.store.clone(),
        state.continuations.clone(),
    );
    let response = router.handle(&raw).await;
    let code = StatusCode::from_u16(response.status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(response.body))
}

async fn healthz() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_logging(format);

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "prometheus exporter installed");
    }

    let config = EngineConfig::from_env();
    let cache_ttl: u64 = std::env::var("CONFIG_CACHE_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .build()?;

    let snapshot: Option<Arc<dyn SnapshotSource>> = std::env::var("CONFIG_SNAPSHOT_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
        .map(|url| Arc::new(HttpSnapshotSource::new(http.clone(), url)) as Arc<dyn SnapshotSource>);
    if snapshot.is_none() {
        tracing::info!("no snapshot source configured; using static configuration");
    }

    let continuations: Option<Arc<dyn ContinuationSink>> = config
        .continuation_url
        .clone()
        .map(|url| Arc::new(HttpContinuationSink::new(http.clone(), url)) as Arc<dyn ContinuationSink>);

    let state = Arc::new(AppState {
        http,
        store: Arc::new(InMemoryGuardStore::new()),
        cached: Mutex::new(CachedConfig::new(config, Duration::from_secs(cache_ttl))),
        snapshot,
        continuations,
    });

    let app = Router::new()
        .route("/events", post(handle_event))
        .route("/healthz", get(healthz))
        .with_state(state);

    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    tracing::info!(%addr, "opsbridged listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
