//! Job-runner API client.
//!
//! Three calls back the execution state machine: start a job, poll an
//! execution's state, fetch its structured log. Start failures are
//! distinguished from everything else — they carry the HTTP status and the
//! raw response body for diagnostics, and the body is captured exactly once
//! before any other inspection (the response stream is one-shot).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};

use opsbridge_core::fields::value_to_string;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

/// Authentication header expected by the job runner.
const AUTH_HEADER: &str = "X-Runner-Auth-Token";

/// Remote execution state as reported by a poll tick.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionStatus {
    /// Whether the execution reached a terminal state.
    #[serde(default)]
    pub completed: bool,
    /// The remote state name (e.g. `succeeded`, `failed`).
    #[serde(default, rename = "executionState")]
    pub execution_state: Option<String>,
}

/// The fetched execution output.
#[derive(Debug, Clone)]
pub enum ExecutionOutput {
    /// Structured log entries, one raw line each.
    Entries(Vec<String>),
    /// Raw response text (truncated) when the structured form failed to
    /// parse.
    Raw(String),
}

/// Client for the job-runner API.
#[derive(Clone)]
pub struct RunnerClient {
    http: reqwest::Client,
    config: RunnerConfig,
    metrics: EngineMetrics,
}

impl RunnerClient {
    /// Creates a client over a shared HTTP connection pool.
    #[must_use]
    pub fn new(http: reqwest::Client, config: RunnerConfig) -> Self {
        if config.api_token.is_empty() {
            tracing::warn!("job runner API token missing; requests may fail");
        }
        Self {
            http,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Submits a start request and returns the new execution id.
    ///
    /// # Errors
    ///
    /// Any non-2xx response, unparseable body, or missing execution id is a
    /// [`Error::StartRejected`] carrying the raw status and body; transport
    /// failures surface as [`Error::Transport`].
    pub async fn start_job(
        &self,
        job_id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<String> {
        let url = self.url(&format!("/job/{job_id}/run"));
        let payload = json!({"project": self.config.project, "options": options});
        tracing::info!(job_id = %job_id, project = %self.config.project, options = options.len(), "starting job");

        let response = self
            .http
            .post(&url)
            .timeout(self.config.timeout)
            .header(AUTH_HEADER, &self.config.api_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        // The body stream is one-shot: capture it before anything else.
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::error!(status = %status, body = %body.chars().take(800).collect::<String>(), "job start rejected");
            self.metrics.record_start("rejected");
            return Err(Error::StartRejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            tracing::error!(error = %err, preview = %body.chars().take(200).collect::<String>(), "start response JSON parse error");
            self.metrics.record_start("unparseable");
            Error::StartRejected {
                status: 502,
                body: format!("invalid JSON in start response: {err}"),
            }
        })?;

        let execution_id = parsed
            .get("id")
            .filter(|id| !id.is_null())
            .map(value_to_string)
            .unwrap_or_default();
        if execution_id.is_empty() {
            self.metrics.record_start("missing_id");
            return Err(Error::StartRejected {
                status: 502,
                body: "start succeeded but no execution id in response".to_string(),
            });
        }

        tracing::info!(execution_id = %execution_id, "execution started");
        self.metrics.record_start("started");
        Ok(execution_id)
    }

    /// Polls the execution at a fixed interval until it completes.
    ///
    /// Blocks for up to `poll_interval x max_poll_attempts`. Callers
    /// needing non-blocking behavior must hand off to the continuation
    /// path instead of raising this bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollTimeout`] when the attempt budget is exhausted,
    /// [`Error::UpstreamStatus`] on a non-2xx tick, or
    /// [`Error::Transport`] on transport failure.
    pub async fn poll_until_done(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let url = self.url(&format!("/execution/{execution_id}/state"));
        tracing::info!(
            execution_id = %execution_id,
            max_attempts = self.config.max_poll_attempts,
            interval_secs = self.config.poll_interval.as_secs_f64(),
            "polling execution",
        );

        for attempt in 1..=self.config.max_poll_attempts {
            let response = self
                .http
                .get(&url)
                .timeout(self.config.timeout)
                .header(AUTH_HEADER, &self.config.api_token)
                .send()
                .await?;
            self.metrics.record_poll_tick();

            if !response.status().is_success() {
                return Err(Error::UpstreamStatus {
                    status: response.status().as_u16(),
                    context: format!("checking execution {execution_id}"),
                });
            }
            let status: ExecutionStatus = response.json().await?;
            tracing::debug!(execution_id = %execution_id, attempt, completed = status.completed, "poll tick");

            if status.completed {
                tracing::info!(
                    execution_id = %execution_id,
                    final_state = status.execution_state.as_deref().unwrap_or("(unknown)"),
                    "execution complete",
                );
                return Ok(status);
            }
            if attempt < self.config.max_poll_attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        tracing::error!(execution_id = %execution_id, "poll budget exhausted");
        Err(Error::PollTimeout {
            execution_id: execution_id.to_string(),
        })
    }

    /// Fetches the structured log of a finished execution.
    ///
    /// An unparseable response degrades to raw truncated text instead of
    /// failing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamStatus`] on a non-2xx response or
    /// [`Error::Transport`] on transport failure.
    pub async fn fetch_output(&self, execution_id: &str) -> Result<ExecutionOutput> {
        let url = self.url(&format!("/execution/{execution_id}/output"));
        let response = self
            .http
            .get(&url)
            .timeout(self.config.timeout)
            .header(AUTH_HEADER, &self.config.api_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::UpstreamStatus {
                status: response.status().as_u16(),
                context: format!("fetching output of execution {execution_id}"),
            });
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => {
                let lines = parsed
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|entry| {
                                entry
                                    .get("log")
                                    .and_then(Value::as_str)
                                    .unwrap_or("")
                                    .to_string()
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ExecutionOutput::Entries(lines))
            }
            Err(_) => {
                tracing::warn!(execution_id = %execution_id, size = text.len(), "output not structured; returning raw text");
                Ok(ExecutionOutput::Raw(
                    text.trim().chars().take(self.config.output_cap).collect(),
                ))
            }
        }
    }
}
