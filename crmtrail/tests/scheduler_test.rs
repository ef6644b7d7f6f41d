mod common;

use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use common::Harness;
use crmtrail::config::LogTailOptions;
use crmtrail::coordinator::JobPolicy;
use crmtrail::jobs::LogTailJob;
use crmtrail::scheduler::{start_jobs, GetLastReport, JobActor, RunJob};
use crmtrail::RunState;
use crmtrail_state::format_watermark;
use tokio_test::assert_ok;

fn traces_job() -> Arc<dyn JobPolicy> {
    Arc::new(LogTailJob::plugin_trace_log(
        "traces",
        "traces.watermark",
        "1.0",
        &LogTailOptions::default(),
    ))
}

#[actix_rt::test]
async fn test_runs_of_one_job_never_overlap() {
    let harness = Harness::new(1);
    harness.backend.set_delay(Duration::from_millis(100));

    let addr = JobActor::new(harness.coordinator.clone(), traces_job(), Duration::from_secs(3600))
        .run_at_start(false)
        .start();

    let (first, second) = futures::join!(addr.send(RunJob), addr.send(RunJob));
    let first = assert_ok!(first);
    let second = assert_ok!(second);

    assert_eq!(first.final_state(), RunState::CheckpointAdvanced);
    assert_eq!(second.final_state(), RunState::CheckpointAdvanced);
    assert_eq!(harness.backend.calls().len(), 2);
    assert_eq!(harness.backend.max_in_flight(), 1);

    // the second run starts where the first one ended, at stored precision
    assert_eq!(
        format_watermark(&second.window.unwrap().start()),
        format_watermark(&first.window.unwrap().end())
    );
}

#[actix_rt::test]
async fn test_last_report_is_kept() {
    let harness = Harness::new(1);
    let addr = JobActor::new(harness.coordinator.clone(), traces_job(), Duration::from_secs(3600))
        .run_at_start(false)
        .start();

    assert!(assert_ok!(addr.send(GetLastReport).await).is_none());

    let report = assert_ok!(addr.send(RunJob).await);
    let last = assert_ok!(addr.send(GetLastReport).await).unwrap();

    assert_eq!(last.session_id, report.session_id);
    assert_eq!(last.job, "traces");
}

#[actix_rt::test]
async fn test_started_jobs_run_on_start() {
    let harness = Harness::new(1);
    let actors = start_jobs(&harness.coordinator, vec![(traces_job(), Duration::from_secs(3600))]);
    assert_eq!(actors.len(), 1);
    assert_eq!(actors[0].0, "traces");

    let mut last = None;
    for _ in 0..50 {
        last = assert_ok!(actors[0].1.send(GetLastReport).await);
        if last.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let last = last.unwrap();
    assert_eq!(last.final_state(), RunState::CheckpointAdvanced);
    assert!(harness.get("traces.watermark").await.is_some());
}
