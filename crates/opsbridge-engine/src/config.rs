//! Engine configuration.
//!
//! Configuration is an explicitly owned snapshot: static defaults, overlaid
//! by environment variables at startup, optionally overlaid again by a
//! periodically fetched remote snapshot ([`SnapshotSource`]). Each
//! invocation takes its own cloned snapshot; nothing is shared mutably.
//!
//! Absence of a snapshot source — or a failed or empty fetch — is never an
//! error: the current values simply stay in effect.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use opsbridge_core::fields::normalize_key;
use opsbridge_core::options::OptionMaps;

use crate::error::Result;
use crate::guard::FailPolicy;

/// Minimum remote-snapshot cache interval.
const MIN_SNAPSHOT_TTL: Duration = Duration::from_secs(10);

/// Incident-management API settings.
#[derive(Debug, Clone)]
pub struct IncidentConfig {
    /// Base URL of the incident-management API.
    pub base_url: String,
    /// Bearer credential for all calls.
    pub api_token: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Maximum attempts per call (first try included).
    pub max_attempts: u32,
    /// Base backoff between retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Mirror/ready signal settings.
    pub mirror: MirrorConfig,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://incident.example.com".to_string(),
            api_token: String::new(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            mirror: MirrorConfig::default(),
        }
    }
}

/// Mirror/ready signal settings.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Display name of the mirror custom field (used for discovery).
    pub field_name: String,
    /// Known field id; skips discovery when set.
    pub field_id: Option<String>,
    /// Known field slug; skips slug lookup when set.
    pub field_slug: Option<String>,
    /// Prefix of generated mirror tokens.
    pub token_prefix: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            field_name: "Mirror Ready Token".to_string(),
            field_id: None,
            field_slug: None,
            token_prefix: "mrr".to_string(),
        }
    }
}

/// Job-runner API settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the job-runner API.
    pub base_url: String,
    /// Authentication token for all calls.
    pub api_token: String,
    /// Project the jobs live in.
    pub project: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Interval between execution poll ticks.
    pub poll_interval: Duration,
    /// Maximum poll ticks before a timeout error surfaces.
    pub max_poll_attempts: u32,
    /// Maximum characters of raw output kept when the structured log is
    /// unparseable.
    pub output_cap: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://jobs.example.com/api".to_string(),
            api_token: String::new(),
            project: "ops".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(6),
            max_poll_attempts: 40,
            output_cap: 8000,
        }
    }
}

/// Static routing tables and the custom-field slugs that feed them.
#[derive(Debug, Clone)]
pub struct RoutingTables {
    /// Manual job key → remediation job id (keys normalized).
    pub remediation_jobs: BTreeMap<String, String>,
    /// Manual job key → diagnosis job id (keys normalized).
    pub diagnosis_jobs: BTreeMap<String, String>,
    /// Watch key → auto-diagnosis job id (keys normalized).
    pub watch_to_diagnosis: BTreeMap<String, String>,
    /// Custom-field slug carrying the watch key.
    pub watch_field: String,
    /// Custom-field slug carrying a manual remediation selection.
    pub remediation_field: String,
    /// Custom-field slug carrying a manual diagnosis selection.
    pub diagnosis_field: String,
}

impl Default for RoutingTables {
    fn default() -> Self {
        Self {
            remediation_jobs: BTreeMap::new(),
            diagnosis_jobs: BTreeMap::new(),
            watch_to_diagnosis: BTreeMap::new(),
            watch_field: "watch_id".to_string(),
            remediation_field: "remediation_job".to_string(),
            diagnosis_field: "diagnosis_job".to_string(),
        }
    }
}

/// Idempotency guard TTLs and failure policy.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    /// Window suppressing duplicate manual job triggers.
    pub trigger_ttl: Duration,
    /// Window suppressing duplicate auto triggers and notes.
    pub auto_dedupe_ttl: Duration,
    /// Window suppressing duplicate mirror/ready writes.
    pub mirror_dedupe_ttl: Duration,
    /// Behavior on guard-store infrastructure errors.
    pub fail_policy: FailPolicy,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            trigger_ttl: Duration::from_secs(5),
            auto_dedupe_ttl: Duration::from_secs(300),
            mirror_dedupe_ttl: Duration::from_secs(300),
            fail_policy: FailPolicy::Closed,
        }
    }
}

/// The full engine configuration snapshot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Incident-management API settings.
    pub incident: IncidentConfig,
    /// Job-runner API settings.
    pub runner: RunnerConfig,
    /// Routing tables.
    pub routing: RoutingTables,
    /// Option-building maps.
    pub options: OptionMaps,
    /// Options that must be present and non-blank before an automatically
    /// selected diagnosis job may start.
    pub required_auto_options: Vec<String>,
    /// Guard TTLs and failure policy.
    pub guard: GuardSettings,
    /// Endpoint receiving self-dispatched poll continuations; inline
    /// blocking poll when absent.
    pub continuation_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            incident: IncidentConfig::default(),
            runner: RunnerConfig::default(),
            routing: RoutingTables::default(),
            options: OptionMaps::default(),
            required_auto_options: vec!["env_orn".to_string()],
            guard: GuardSettings::default(),
            continuation_url: None,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key).map(|v| v.trim().eq_ignore_ascii_case("true")).unwrap_or(default)
}

fn env_json_map(key: &str) -> BTreeMap<String, String> {
    env::var(key)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn env_json_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().and_then(|raw| serde_json::from_str(&raw).ok())
}

/// Normalizes the keys of a routing map via [`normalize_key`].
fn normalize_map_keys(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().map(|(k, v)| (normalize_key(&k), v)).collect()
}

impl EngineConfig {
    /// Loads configuration from the environment on top of static defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.incident.base_url = env_string("INCIDENT_BASE_URL", &config.incident.base_url);
        config.incident.api_token = env_string("INCIDENT_API_TOKEN", "");
        config.incident.timeout =
            Duration::from_secs(env_parse("HTTP_TIMEOUT_SECONDS", 30));
        config.incident.mirror.field_name =
            env_string("MIRROR_FIELD_NAME", &config.incident.mirror.field_name);
        config.incident.mirror.field_id = env_opt("MIRROR_FIELD_ID");
        config.incident.mirror.field_slug = env_opt("MIRROR_FIELD_SLUG");
        config.incident.mirror.token_prefix =
            env_opt("MIRROR_TOKEN_PREFIX").unwrap_or(config.incident.mirror.token_prefix);

        config.runner.base_url = env_string("RUNNER_URL", &config.runner.base_url);
        config.runner.api_token = env_string("RUNNER_API_TOKEN", "");
        config.runner.project = env_string("RUNNER_PROJECT", &config.runner.project);
        config.runner.timeout = config.incident.timeout;
        config.runner.poll_interval = Duration::from_secs(env_parse("POLLING_INTERVAL", 6));
        config.runner.max_poll_attempts = env_parse("MAX_POLL_ATTEMPTS", 40);

        config.routing.remediation_jobs =
            normalize_map_keys(env_json_map("REMEDIATION_JOB_MAP"));
        config.routing.diagnosis_jobs = normalize_map_keys(env_json_map("DIAGNOSIS_JOB_MAP"));
        config.routing.watch_to_diagnosis =
            normalize_map_keys(env_json_map("WATCH_TO_DIAG_MAP"));

        config.options.overrides = env_json_map("OPTION_MAP");
        config.options.pass_all_custom_fields = env_flag("PASS_ALL_CUSTOM_FIELDS", false);
        config.required_auto_options = env_json_list("REQUIRED_AUTO_DIAGNOSIS_OPTIONS")
            .unwrap_or_else(|| vec!["env_orn".to_string()]);

        config.guard.trigger_ttl = Duration::from_secs(env_parse("GUARD_TTL_SECONDS", 5));
        config.guard.auto_dedupe_ttl = Duration::from_secs(env_parse("AUTO_DEDUPE_TTL", 300));
        config.guard.mirror_dedupe_ttl =
            Duration::from_secs(env_parse("MIRROR_DEDUPE_TTL", 300));
        config.guard.fail_policy = if env_flag("FAIL_OPEN_ON_GUARD_ERROR", false) {
            FailPolicy::Open
        } else {
            FailPolicy::Closed
        };

        config.continuation_url = env_opt("CONTINUATION_URL");

        config
    }

    /// Applies a remote snapshot's overrides in place.
    ///
    /// Empty sections leave current values untouched, mirroring the
    /// keep-on-empty semantics of the snapshot service.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(runner) = overrides.runner {
            if let Some(url) = runner.url.filter(|u| !u.is_empty()) {
                self.runner.base_url = url;
            }
            if let Some(project) = runner.project.filter(|p| !p.is_empty()) {
                self.runner.project = project;
            }
        }
        if let Some(jobs) = overrides.jobs {
            if let Some(map) = jobs.remediation.filter(|m| !m.is_empty()) {
                self.routing.remediation_jobs = normalize_map_keys(map);
            }
            if let Some(map) = jobs.diagnosis.filter(|m| !m.is_empty()) {
                self.routing.diagnosis_jobs = normalize_map_keys(map);
            }
            if let Some(map) = jobs.watch_to_diagnosis.filter(|m| !m.is_empty()) {
                self.routing.watch_to_diagnosis = normalize_map_keys(map);
            }
        }
        if let Some(map) = overrides.option_map.filter(|m| !m.is_empty()) {
            self.options.overrides = map;
        }
        if let Some(required) = overrides.auto_required_options.filter(|r| !r.is_empty()) {
            self.required_auto_options = required;
        }
        if let Some(pass_all) = overrides.pass_all_custom_fields {
            self.options.pass_all_custom_fields = pass_all;
        }

        tracing::info!(
            remediation = self.routing.remediation_jobs.len(),
            diagnosis = self.routing.diagnosis_jobs.len(),
            watch = self.routing.watch_to_diagnosis.len(),
            auto_required = self.required_auto_options.len(),
            pass_all = self.options.pass_all_custom_fields,
            "configuration overrides applied",
        );
    }
}

/// Overrides delivered by a configuration snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    /// Job-runner endpoint overrides.
    pub runner: Option<RunnerOverride>,
    /// Routing table overrides.
    pub jobs: Option<JobsOverride>,
    /// Dynamic option-map override.
    pub option_map: Option<BTreeMap<String, String>>,
    /// Required auto-diagnosis option names.
    pub auto_required_options: Option<Vec<String>>,
    /// Pass-all custom fields flag.
    pub pass_all_custom_fields: Option<bool>,
}

/// Job-runner endpoint overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerOverride {
    /// Base URL override.
    pub url: Option<String>,
    /// Project override.
    pub project: Option<String>,
}

/// Routing table overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobsOverride {
    /// Manual key → remediation job id.
    pub remediation: Option<BTreeMap<String, String>>,
    /// Manual key → diagnosis job id.
    pub diagnosis: Option<BTreeMap<String, String>>,
    /// Watch key → diagnosis job id.
    pub watch_to_diagnosis: Option<BTreeMap<String, String>>,
}

/// Source of remote configuration snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetches the latest overrides, or `None` when the source has nothing.
    async fn fetch(&self) -> Result<Option<ConfigOverrides>>;
}

/// HTTP snapshot source: `GET <url>` returning an overrides document.
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSnapshotSource {
    /// Creates a new HTTP snapshot source.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<Option<ConfigOverrides>> {
        let response = self.http.get(&self.url).timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::Error::configuration(format!(
                "snapshot endpoint responded {}",
                response.status(),
            )));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let overrides = serde_json::from_str(&text).map_err(|err| {
            crate::error::Error::configuration(format!("snapshot JSON parse error: {err}"))
        })?;
        Ok(Some(overrides))
    }
}

/// A configuration snapshot with lazy remote refresh.
///
/// Refresh happens by explicit call at the start of each invocation; inside
/// the cache interval it is a no-op. Fetch failures keep the current
/// configuration in effect.
pub struct CachedConfig {
    config: EngineConfig,
    ttl: Duration,
    fetched_at: Option<Instant>,
}

impl CachedConfig {
    /// Creates a cache around an initial configuration.
    ///
    /// The cache interval is clamped to a 10-second minimum.
    #[must_use]
    pub fn new(config: EngineConfig, ttl: Duration) -> Self {
        Self {
            config,
            ttl: ttl.max(MIN_SNAPSHOT_TTL),
            fetched_at: None,
        }
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clones the current configuration for one invocation.
    #[must_use]
    pub fn snapshot(&self) -> EngineConfig {
        self.config.clone()
    }

    /// Refreshes from the source if the cache interval has elapsed.
    pub async fn refresh(&mut self, source: &dyn SnapshotSource) {
        if self
            .fetched_at
            .is_some_and(|fetched| fetched.elapsed() < self.ttl)
        {
            return;
        }
        match source.fetch().await {
            Ok(Some(overrides)) => {
                self.config.apply_overrides(overrides);
                self.fetched_at = Some(Instant::now());
            }
            Ok(None) => {
                tracing::warn!("snapshot source returned empty configuration; keeping current");
                self.fetched_at = Some(Instant::now());
            }
            Err(err) => {
                tracing::warn!(error = %err, "snapshot refresh failed; keeping current");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.runner.poll_interval, Duration::from_secs(6));
        assert_eq!(config.runner.max_poll_attempts, 40);
        assert_eq!(config.guard.trigger_ttl, Duration::from_secs(5));
        assert_eq!(config.guard.auto_dedupe_ttl, Duration::from_secs(300));
        assert_eq!(config.guard.fail_policy, FailPolicy::Closed);
        assert!(config.continuation_url.is_none());
    }

    #[test]
    fn overrides_normalize_job_map_keys() {
        let mut config = EngineConfig::default();
        let overrides: ConfigOverrides = serde_json::from_str(
            r#"{
                "runner": {"url": "https://runner.internal/api", "project": "prod"},
                "jobs": {
                    "remediation": {"Restart IIS": "job-1"},
                    "watchToDiagnosis": {"Disk Pressure": "job-2"}
                },
                "optionMap": {"data.custom_fields.region": "region"},
                "autoRequiredOptions": ["env_orn", "region"],
                "passAllCustomFields": true
            }"#,
        )
        .expect("parse overrides");
        config.apply_overrides(overrides);

        assert_eq!(config.runner.base_url, "https://runner.internal/api");
        assert_eq!(config.runner.project, "prod");
        assert_eq!(
            config.routing.remediation_jobs.get("restart_iis").map(String::as_str),
            Some("job-1"),
        );
        assert_eq!(
            config.routing.watch_to_diagnosis.get("disk_pressure").map(String::as_str),
            Some("job-2"),
        );
        assert_eq!(config.required_auto_options, vec!["env_orn", "region"]);
        assert!(config.options.pass_all_custom_fields);
    }

    #[test]
    fn empty_override_sections_keep_current_values() {
        let mut config = EngineConfig::default();
        config.routing.diagnosis_jobs.insert("existing".into(), "job-0".into());
        config.apply_overrides(ConfigOverrides::default());
        assert_eq!(
            config.routing.diagnosis_jobs.get("existing").map(String::as_str),
            Some("job-0"),
        );
    }

    #[tokio::test]
    async fn cached_config_skips_refresh_inside_interval() {
        struct CountingSource(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl SnapshotSource for CountingSource {
            async fn fetch(&self) -> Result<Option<ConfigOverrides>> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Some(ConfigOverrides::default()))
            }
        }

        let source = CountingSource(std::sync::atomic::AtomicUsize::new(0));
        let mut cached = CachedConfig::new(EngineConfig::default(), Duration::from_secs(60));
        cached.refresh(&source).await;
        cached.refresh(&source).await;
        cached.refresh(&source).await;
        assert_eq!(source.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_current_configuration() {
        struct FailingSource;

        #[async_trait]
        impl SnapshotSource for FailingSource {
            async fn fetch(&self) -> Result<Option<ConfigOverrides>> {
                Err(crate::error::Error::configuration("snapshot unreachable"))
            }
        }

        let mut config = EngineConfig::default();
        config.runner.project = "keep-me".into();
        let mut cached = CachedConfig::new(config, Duration::from_secs(60));
        cached.refresh(&FailingSource).await;
        assert_eq!(cached.config().runner.project, "keep-me");
    }
}
