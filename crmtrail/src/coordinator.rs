//! Run coordination
//!
//! One [`RunCoordinator`] drives every job type through the same state
//! machine:
//!
//! ```text
//! Idle -> WindowPlanned -> Skipped
//!                       -> Executing -> Emitted -> CheckpointAdvanced
//! (any state) -> Failed
//! ```
//!
//! The watermark is read at the start and written only after every event of
//! the run has been flushed to the sink.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_state::{format_watermark, Checkpoint, StateStore};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::resolve_candidates;
use crate::gateway::{BackendClient, BackendGateway};
use crate::planner::{plan, ExtractionWindow, WindowDecision, WindowPolicy};
use crate::telemetry::{RunTelemetry, TelemetrySink};

/// States of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Not started
    Idle,
    /// Watermark read and window decided
    WindowPlanned,
    /// Nothing due; no query and no write happened
    Skipped,
    /// Backend operations in progress
    Executing,
    /// All events flushed to the sink
    Emitted,
    /// Watermark persisted
    CheckpointAdvanced,
    /// Run aborted; watermark untouched
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a job needs during `execute`
pub struct JobContext<'a> {
    /// Backend access for this run
    pub gateway: &'a BackendGateway,
    /// Store holding job documents (tracked entities, filters)
    pub store: &'a dyn StateStore,
    /// Telemetry of this run
    pub telemetry: &'a RunTelemetry,
    /// Window to query, `None` for unwindowed jobs
    pub window: Option<ExtractionWindow>,
}

impl JobContext<'_> {
    /// Window of a windowed job
    pub fn require_window(&self) -> Result<ExtractionWindow> {
        self.window
            .ok_or_else(|| CrmTrailError::State("Windowed job executed without a window".into()))
    }
}

/// Result of a successful `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobOutcome {
    /// Events recorded
    pub emitted: usize,
    /// Watermark to persist; `None` means the window end
    pub next_watermark: Option<DateTime<Utc>>,
}

/// What varies between job types
#[async_trait]
pub trait JobPolicy: Send + Sync {
    /// Job name, also the telemetry service name
    fn name(&self) -> &str;

    /// Store key of the job's watermark
    fn stream_key(&self) -> &str;

    /// How the job derives its window
    fn window_policy(&self) -> WindowPolicy;

    /// Run the backend operations and record the events
    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome>;
}

/// Builds the backend client of one run
pub type ClientFactory = Arc<dyn Fn() -> Result<Arc<dyn BackendClient>> + Send + Sync>;

/// Trail and outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Job name
    pub job: String,
    /// Telemetry session id
    pub session_id: Uuid,
    /// States visited, in order
    pub states: Vec<RunState>,
    /// Window queried
    pub window: Option<ExtractionWindow>,
    /// Events recorded
    pub emitted: usize,
    /// Watermark written by this run
    pub watermark: Option<DateTime<Utc>>,
    /// Why the run failed or was skipped
    pub reason: Option<String>,
}

impl RunReport {
    fn new(job: &str, session_id: Uuid) -> Self {
        Self {
            job: job.to_string(),
            session_id,
            states: vec![RunState::Idle],
            window: None,
            emitted: 0,
            watermark: None,
            reason: None,
        }
    }

    /// Last state reached
    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }

    /// Whether the run failed
    pub fn is_failed(&self) -> bool {
        self.final_state() == RunState::Failed
    }

    fn transition(&mut self, state: RunState) {
        debug!("{}: {} -> {}", self.job, self.final_state(), state);
        self.states.push(state);
    }

    fn skip(mut self, reason: String) -> Self {
        info!("{}: skipped, {}", self.job, reason);
        self.reason = Some(reason);
        self.transition(RunState::Skipped);
        self
    }

    fn fail(mut self, error: &CrmTrailError) -> Self {
        error!("{}: run failed in state {}: {}", self.job, self.final_state(), error);
        self.reason = Some(error.to_string());
        self.transition(RunState::Failed);
        self
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.job, self.session_id, self.final_state())?;
        if let Some(window) = &self.window {
            write!(f, " window {}", window)?;
        }
        write!(f, ", {} event(s)", self.emitted)?;
        if let Some(watermark) = &self.watermark {
            write!(f, ", watermark {}", format_watermark(watermark))?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

/// Drives job runs
#[derive(Clone)]
pub struct RunCoordinator {
    project: String,
    connection_document: Option<String>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn TelemetrySink>,
    client_factory: ClientFactory,
}

impl RunCoordinator {
    /// Create a coordinator
    pub fn new(
        project: impl Into<String>,
        connection_document: Option<String>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn TelemetrySink>,
        client_factory: ClientFactory,
    ) -> Self {
        Self {
            project: project.into(),
            connection_document,
            store,
            sink,
            client_factory,
        }
    }

    /// Store holding watermarks and job documents
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run `job` as of now
    pub async fn run_now(&self, job: &dyn JobPolicy) -> RunReport {
        self.run(job, Utc::now()).await
    }

    /// Run `job` as of `now`
    pub async fn run(&self, job: &dyn JobPolicy, now: DateTime<Utc>) -> RunReport {
        let telemetry = RunTelemetry::new(self.sink.clone(), &self.project, job.name());
        let mut report = RunReport::new(job.name(), telemetry.session_id());
        let policy = job.window_policy();
        let checkpoint = Checkpoint::new(job.stream_key(), self.store.clone());

        let watermark = match policy {
            WindowPolicy::Unwindowed => None,
            _ => match checkpoint.read().await {
                Ok(watermark) => watermark,
                Err(e) => return report.fail(&e),
            },
        };

        let decision = match plan(policy, watermark, now) {
            Ok(decision) => decision,
            Err(e) => return report.fail(&e),
        };
        report.transition(RunState::WindowPlanned);

        let window = match decision {
            WindowDecision::Due(window) => Some(window),
            WindowDecision::Unwindowed => None,
            WindowDecision::Pending { due_at } => {
                return report.skip(format!("next window due at {}", format_watermark(&due_at)));
            }
            WindowDecision::NoBaseline => {
                warn!("{}: no watermark under '{}'; seed one to start", job.name(), job.stream_key());
                return report.skip("no baseline watermark".to_string());
            }
        };
        report.window = window;
        report.transition(RunState::Executing);

        let client = match (self.client_factory)() {
            Ok(client) => client,
            Err(e) => return report.fail(&e),
        };
        let gateway = BackendGateway::new(client, resolve_candidates(self.connection_document.as_deref()));

        match &window {
            Some(window) => info!("{}: extracting {}", job.name(), window),
            None => info!("{}: extracting snapshot", job.name()),
        }
        telemetry.event(&format!("Start {}", job.name()), HashMap::new());

        let context = JobContext {
            gateway: &gateway,
            store: self.store.as_ref(),
            telemetry: &telemetry,
            window,
        };

        let outcome = match job.execute(&context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                telemetry.exception(&e.to_string(), HashMap::from([("job".to_string(), job.name().to_string())]));
                if let Err(flush_error) = telemetry.flush().await {
                    warn!("{}: failed to flush exception telemetry: {}", job.name(), flush_error);
                }
                return report.fail(&e);
            }
        };
        report.emitted = outcome.emitted;

        telemetry.event(
            &format!("End {}", job.name()),
            HashMap::from([("RecordCount".to_string(), outcome.emitted.to_string())]),
        );
        if let Err(e) = telemetry.flush().await {
            return report.fail(&e);
        }
        report.transition(RunState::Emitted);

        let Some(window) = window else {
            info!("{}: {}", job.name(), report);
            return report;
        };

        let next = outcome.next_watermark.unwrap_or_else(|| window.end());
        if let Err(e) = checkpoint.advance(next).await {
            return report.fail(&e);
        }
        report.watermark = Some(next);
        report.transition(RunState::CheckpointAdvanced);

        info!("{}: {}", job.name(), report);
        report
    }
}
