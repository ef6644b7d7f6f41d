//! Job scheduling
//!
//! One [`JobActor`] per configured job triggers runs on a fixed interval.
//! A run is handled as an [`AtomicResponse`], so the actor processes nothing
//! else (neither timer ticks nor manual triggers) until the run finishes:
//! runs of the same job never overlap inside one process.

use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use log::{error, info};

use crate::coordinator::{JobPolicy, RunCoordinator, RunReport};

/// Trigger one run of the job
#[derive(Message)]
#[rtype(result = "RunReport")]
pub struct RunJob;

/// Report of the last finished run
#[derive(Message)]
#[rtype(result = "Option<RunReport>")]
pub struct GetLastReport;

/// Actor owning the schedule of one job
pub struct JobActor {
    coordinator: RunCoordinator,
    job: Arc<dyn JobPolicy>,
    interval: Duration,
    run_at_start: bool,
    runs: usize,
    last_report: Option<RunReport>,
}

impl JobActor {
    /// Create an actor running `job` every `interval`
    pub fn new(coordinator: RunCoordinator, job: Arc<dyn JobPolicy>, interval: Duration) -> Self {
        Self {
            coordinator,
            job,
            interval,
            run_at_start: true,
            runs: 0,
            last_report: None,
        }
    }

    /// Whether the first run happens at start instead of after one interval
    pub fn run_at_start(mut self, run_at_start: bool) -> Self {
        self.run_at_start = run_at_start;
        self
    }
}

impl Actor for JobActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Scheduling {} every {:?}", self.job.name(), self.interval);

        if self.run_at_start {
            ctx.notify(RunJob);
        }
        ctx.run_interval(self.interval, |_act, ctx| {
            ctx.notify(RunJob);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Stopped scheduling {} after {} run(s)", self.job.name(), self.runs);
    }
}

impl Handler<RunJob> for JobActor {
    type Result = AtomicResponse<Self, RunReport>;

    fn handle(&mut self, _msg: RunJob, _ctx: &mut Self::Context) -> Self::Result {
        let coordinator = self.coordinator.clone();
        let job = self.job.clone();

        AtomicResponse::new(Box::pin(
            async move { coordinator.run_now(job.as_ref()).await }
                .into_actor(self)
                .map(|report, act, _ctx| {
                    act.runs += 1;
                    if report.is_failed() {
                        error!("{}: run {} failed: {}", act.job.name(), act.runs, report);
                    }
                    act.last_report = Some(report.clone());
                    report
                }),
        ))
    }
}

impl Handler<GetLastReport> for JobActor {
    type Result = MessageResult<GetLastReport>;

    fn handle(&mut self, _msg: GetLastReport, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.last_report.clone())
    }
}

/// Start one actor per job; returns the job names with their addresses
pub fn start_jobs(
    coordinator: &RunCoordinator,
    jobs: Vec<(Arc<dyn JobPolicy>, Duration)>,
) -> Vec<(String, Addr<JobActor>)> {
    jobs.into_iter()
        .map(|(job, interval)| {
            let name = job.name().to_string();
            let addr = JobActor::new(coordinator.clone(), job, interval).start();
            (name, addr)
        })
        .collect()
}
