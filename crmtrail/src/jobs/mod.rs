//! Job policies
//!
//! Each job type is a [`JobPolicy`] run by the
//! [`RunCoordinator`](crate::coordinator::RunCoordinator).

mod entity_delta;
mod log_tail;
mod record_count;
mod snapshot;

pub use entity_delta::{EntityDeltaJob, ENTITY_DELTA_EVENT};
pub use log_tail::LogTailJob;
pub use record_count::RecordCountJob;
pub use snapshot::{PluginStepStatusJob, WorkflowDefinitionJob};

use std::sync::Arc;

use chrono::Duration;
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_state::{StateStore, StateStoreExt};

use crate::collector::EntityDeltaCollector;
use crate::config::{JobConfig, JobKind};
use crate::coordinator::JobPolicy;

/// Build the job policy described by `config`
pub fn build_job(config: &JobConfig) -> Result<Arc<dyn JobPolicy>> {
    let name = config.name.as_str();
    let stream_key = config.checkpoint_key();
    let version = config.version.as_str();

    Ok(match &config.kind {
        JobKind::PluginTraceLog(options) => Arc::new(LogTailJob::plugin_trace_log(name, &stream_key, version, options)),
        JobKind::SystemJobLog(options) => Arc::new(LogTailJob::system_job_log(name, &stream_key, version, options)),
        JobKind::WorkflowLog(options) => Arc::new(LogTailJob::workflow_log(name, &stream_key, version, options)),
        JobKind::EntityDelta { tracked_entities_key, window_minutes, created_attribute, modified_attribute } => {
            let window = i64::try_from(*window_minutes)
                .ok()
                .and_then(Duration::try_minutes)
                .ok_or_else(|| {
                    CrmTrailError::Config(format!("Job '{}': window of {} minutes is out of range", name, window_minutes))
                })?;
            Arc::new(
                EntityDeltaJob::new(name, stream_key, tracked_entities_key.as_str(), window, version)
                    .with_collector(EntityDeltaCollector::new(created_attribute.as_str(), modified_attribute.as_str())),
            )
        }
        JobKind::RecordCount { entities_key } => Arc::new(RecordCountJob::new(name, entities_key.as_str(), version)),
        JobKind::WorkflowInfo { filter_key } => {
            Arc::new(WorkflowDefinitionJob::workflow_info(name, filter_key.as_str(), version))
        }
        JobKind::PowerAutomateFlow { filter_key } => {
            Arc::new(WorkflowDefinitionJob::power_automate_flow(name, filter_key.as_str(), version))
        }
        JobKind::PluginStepStatus { filter_key } => {
            Arc::new(PluginStepStatusJob::new(name, filter_key.clone(), version))
        }
    })
}

/// Read a job document from the store; blank counts as missing
pub async fn read_document(store: &dyn StateStore, key: &str) -> Result<Option<String>> {
    Ok(store.load_raw(key).await?.filter(|text| !text.trim().is_empty()))
}

/// Load a JSON array of names, dropping blanks; missing reads as empty
pub async fn load_name_list(store: &dyn StateStore, key: &str) -> Result<Vec<String>> {
    let names: Vec<String> = store.load_json(key).await?.unwrap_or_default();
    Ok(names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::planner::WindowPolicy;
    use crmtrail_state::MemoryStateStore;

    #[test]
    fn test_build_jobs_from_config() {
        let config = AppConfig::from_yaml_str(
            r#"
jobs:
  - name: traces
    kind: plugin_trace_log
  - name: deltas
    kind: entity_delta
    window_minutes: 90
    checkpoint_key: delta/lastdate.txt
  - name: counts
    kind: record_count
  - name: flows
    kind: power_automate_flow
    filter_key: flows.json
"#,
        )
        .unwrap();

        let jobs: Vec<Arc<dyn JobPolicy>> = config.jobs.iter().map(build_job).collect::<Result<_>>().unwrap();

        assert_eq!(jobs[0].name(), "traces");
        assert_eq!(jobs[0].stream_key(), "traces.watermark");
        assert_eq!(jobs[0].window_policy(), WindowPolicy::UnboundedForward);
        assert_eq!(jobs[1].stream_key(), "delta/lastdate.txt");
        assert_eq!(jobs[1].window_policy(), WindowPolicy::FixedDuration(Duration::minutes(90)));
        assert_eq!(jobs[2].window_policy(), WindowPolicy::Unwindowed);
        assert_eq!(jobs[3].window_policy(), WindowPolicy::Unwindowed);
    }

    #[test]
    fn test_build_job_rejects_unrepresentable_window() {
        let config = AppConfig::from_yaml_str(
            "jobs:\n  - name: deltas\n    kind: entity_delta\n    window_minutes: 200000000000000\n",
        )
        .unwrap();

        assert!(matches!(build_job(&config.jobs[0]), Err(CrmTrailError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_name_list() {
        let store = MemoryStateStore::with_values([
            ("names", r#"["account", " ", "contact "]"#),
            ("object", r#"{"names": []}"#),
        ]);

        assert_eq!(load_name_list(&store, "names").await.unwrap(), vec!["account", "contact"]);
        assert!(load_name_list(&store, "missing").await.unwrap().is_empty());
        assert!(matches!(
            load_name_list(&store, "object").await,
            Err(crmtrail_core::error::CrmTrailError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_read_document_treats_blank_as_missing() {
        let store = MemoryStateStore::with_values([("blank", "  "), ("names", "[\"a\"]")]);

        assert_eq!(read_document(&store, "blank").await.unwrap(), None);
        assert_eq!(read_document(&store, "absent").await.unwrap(), None);
        assert_eq!(read_document(&store, "names").await.unwrap().as_deref(), Some("[\"a\"]"));
    }
}
