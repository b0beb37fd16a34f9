//! Job-execution state machine.
//!
//! One execution flows `Started -> Polling -> {Succeeded, Failed,
//! TimedOut}`. Output is fetched only after a terminal state and
//! immediately normalized; the execution is discarded after its report is
//! delivered — no execution history persists beyond the guard rows.
//!
//! The inline-blocking path and the deferred continuation path both run
//! through [`Orchestrator::await_output`]; only *where* that call happens
//! differs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use opsbridge_core::normalize::normalize_log_lines;

use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::runner::{ExecutionOutput, RunnerClient};

/// State of a remote job execution as tracked by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Started or being polled; not yet terminal.
    Running,
    /// Remote side reported success.
    Succeeded,
    /// Remote side reported a non-success terminal state.
    Failed,
    /// Polling exhausted its budget before completion.
    TimedOut,
}

impl ExecutionState {
    /// Returns the lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
        }
    }
}

/// One remote job execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Execution identifier assigned by the job runner.
    pub id: String,
    /// Current state as tracked by the bridge.
    pub state: ExecutionState,
    /// Normalized output, present once fetched.
    pub output: Option<String>,
}

impl Execution {
    /// Wraps an execution id received from a continuation event.
    #[must_use]
    pub fn resumed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ExecutionState::Running,
            output: None,
        }
    }
}

/// Owns the start → poll → fetch state machine for single executions.
#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<RunnerClient>,
    metrics: EngineMetrics,
}

impl Orchestrator {
    /// Creates an orchestrator over a runner client.
    #[must_use]
    pub fn new(runner: Arc<RunnerClient>) -> Self {
        Self {
            runner,
            metrics: EngineMetrics::new(),
        }
    }

    /// Starts a job and returns the running execution.
    ///
    /// # Errors
    ///
    /// Start failures surface as [`Error::StartRejected`] (distinct from
    /// every poll-phase error) or [`Error::Transport`].
    pub async fn start(
        &self,
        job_id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Execution> {
        let id = self.runner.start_job(job_id, options).await?;
        Ok(Execution {
            id,
            state: ExecutionState::Running,
            output: None,
        })
    }

    /// Awaits completion and returns the normalized report text.
    ///
    /// Polls until the remote side reports a terminal state, records it on
    /// the execution, then fetches and normalizes the output. With
    /// `require_success`, a non-success terminal state is an error and no
    /// output is fetched; without it (the continuation path), output is
    /// collected whatever the terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollTimeout`] when the poll budget is exhausted,
    /// [`Error::ExecutionFailed`] when success was required but not
    /// reached, and the runner client's errors otherwise.
    pub async fn await_output(
        &self,
        execution: &mut Execution,
        require_success: bool,
    ) -> Result<String> {
        let started = Instant::now();

        let status = match self.runner.poll_until_done(&execution.id).await {
            Ok(status) => status,
            Err(err) => {
                if matches!(err, Error::PollTimeout { .. }) {
                    execution.state = ExecutionState::TimedOut;
                }
                return Err(err);
            }
        };

        let state = status.execution_state.unwrap_or_default().to_lowercase();
        let succeeded = state == "succeeded";
        execution.state = if succeeded {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        };
        if require_success && !succeeded {
            return Err(Error::ExecutionFailed {
                execution_id: execution.id.clone(),
                state,
            });
        }

        let text = match self.runner.fetch_output(&execution.id).await? {
            ExecutionOutput::Entries(lines) => normalize_log_lines(lines),
            ExecutionOutput::Raw(raw) => raw,
        };
        self.metrics
            .observe_report_collect(started.elapsed().as_secs_f64());
        execution.output = Some(text.clone());
        Ok(text)
    }
}
