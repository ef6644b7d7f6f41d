//! Snapshot jobs
//!
//! Read the current state of process definitions instead of a time window.
//! They keep no watermark; a failed snapshot is simply retried by the next run.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use crmtrail_core::error::Result;
use crmtrail_core::flatten::RecordFlattener;
use crmtrail_core::query::{
    format_timestamp, ColumnSet, Condition, FilterExpression, LogicalOperator, QueryExpression,
};
use crmtrail_core::record::{BackendRecord, ENTITY_NAME_KEY, VERSION_KEY};
use crmtrail_state::StateStoreExt;
use log::info;
use serde::Deserialize;

use crate::coordinator::{JobContext, JobOutcome, JobPolicy};
use crate::jobs::load_name_list;
use crate::planner::WindowPolicy;

/// Workflow category of classic workflows
pub const CLASSIC_WORKFLOW: u32 = 0;

/// Workflow category of Power Automate (modern) flows
pub const MODERN_FLOW: u32 = 5;

/// Definitions of named workflows of one category
#[derive(Debug, Clone)]
pub struct WorkflowDefinitionJob {
    name: String,
    filter_key: String,
    category: u32,
    event_name: String,
    flattener: RecordFlattener,
}

impl WorkflowDefinitionJob {
    /// Classic workflows
    pub fn workflow_info(name: impl Into<String>, filter_key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_key: filter_key.into(),
            category: CLASSIC_WORKFLOW,
            event_name: "Workflow record".to_string(),
            flattener: RecordFlattener::new("workflow", version),
        }
    }

    /// Power Automate flows
    pub fn power_automate_flow(name: impl Into<String>, filter_key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_key: filter_key.into(),
            category: MODERN_FLOW,
            event_name: "PAF record".to_string(),
            flattener: RecordFlattener::new("paf", version),
        }
    }

    /// Query for the named definitions
    pub fn query(&self, names: &[String]) -> QueryExpression {
        QueryExpression::new("workflow")
            .with_columns(ColumnSet::columns(["name", "category", "statecode", "modifiedon"]))
            .with_condition(Condition::equal("category", self.category.to_string()))
            .with_condition(Condition::in_values("name", names.iter().cloned()))
            .with_order("name", false)
            .with_order("modifiedon", true)
            .distinct()
    }
}

#[async_trait]
impl JobPolicy for WorkflowDefinitionJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_key(&self) -> &str {
        &self.name
    }

    fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::Unwindowed
    }

    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome> {
        let names = load_name_list(context.store, &self.filter_key).await?;
        if names.is_empty() {
            info!("{}: name filter '{}' is empty, nothing to query", self.name, self.filter_key);
            return Ok(JobOutcome::default());
        }

        let records = context.gateway.retrieve_multiple(&self.query(&names)).await?;
        info!("{}: retrieved {} definition(s)", self.name, records.len());

        for record in &records {
            context
                .telemetry
                .event(&self.event_name, self.flattener.flatten(record).into_properties());
        }

        Ok(JobOutcome { emitted: records.len(), next_watermark: None })
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StepFilter {
    #[serde(default)]
    name_filters: Vec<String>,
}

/// Latest state of every plugin step, one event per step name
#[derive(Debug, Clone)]
pub struct PluginStepStatusJob {
    name: String,
    filter_key: Option<String>,
    version: String,
}

impl PluginStepStatusJob {
    /// Create a job; `filter_key` names a `{"nameFilters": [...]}` document
    pub fn new(name: impl Into<String>, filter_key: Option<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), filter_key, version: version.into() }
    }

    /// Query for the steps, restricted to `names` when not empty
    pub fn query(&self, names: &[String]) -> QueryExpression {
        let query = QueryExpression::new("sdkmessageprocessingstep")
            .with_columns(ColumnSet::columns([
                "name",
                "statecode",
                "statuscode",
                "modifiedon",
                "createdon",
                "modifiedby",
            ]))
            .with_order("name", false)
            .distinct();

        if names.is_empty() {
            return query;
        }
        let filter = names
            .iter()
            .fold(FilterExpression::new(LogicalOperator::Or), |filter, name| {
                filter.with_condition(Condition::equal("name", name.as_str()))
            });
        query.with_filter(filter)
    }

    async fn name_filters(&self, context: &JobContext<'_>) -> Result<Vec<String>> {
        let Some(key) = &self.filter_key else {
            return Ok(Vec::new());
        };
        let filter: Option<StepFilter> = context.store.load_json(key).await?;
        Ok(filter.map(|filter| filter.name_filters).unwrap_or_default())
    }

    /// Keep the most recently modified row per step name, ordered by name
    pub fn latest_per_name(records: Vec<BackendRecord>) -> Vec<BackendRecord> {
        let mut latest: BTreeMap<String, BackendRecord> = BTreeMap::new();
        for record in records {
            let Some(name) = record.get("name").map(|value| value.raw()) else {
                continue;
            };
            let newer = match latest.get(&name) {
                Some(current) => record.timestamp("modifiedon") > current.timestamp("modifiedon"),
                None => true,
            };
            if newer {
                latest.insert(name, record);
            }
        }
        latest.into_values().collect()
    }

    fn properties(&self, record: &BackendRecord) -> HashMap<String, String> {
        let mut properties = HashMap::from([
            (ENTITY_NAME_KEY.to_string(), "sdkmessageprocessingstep".to_string()),
            (VERSION_KEY.to_string(), self.version.clone()),
        ]);
        for key in ["name", "statecode", "statuscode", "modifiedby"] {
            if let Some(value) = record.get(key) {
                properties.insert(key.to_string(), value.raw());
            }
        }
        for key in ["modifiedon", "createdon"] {
            let value = record
                .timestamp(key)
                .map(|timestamp| format_timestamp(&timestamp))
                .or_else(|| record.get(key).map(|value| value.raw()));
            if let Some(value) = value {
                properties.insert(key.to_string(), value);
            }
        }
        properties
    }
}

#[async_trait]
impl JobPolicy for PluginStepStatusJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_key(&self) -> &str {
        &self.name
    }

    fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::Unwindowed
    }

    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome> {
        let names = self.name_filters(context).await?;
        let records = context.gateway.retrieve_multiple(&self.query(&names)).await?;
        let total = records.len();

        let steps = Self::latest_per_name(records);
        info!("{}: {} row(s) reduced to {} step(s)", self.name, total, steps.len());

        for step in &steps {
            context
                .telemetry
                .event("sdkmessageprocessingstep record", self.properties(step));
        }

        Ok(JobOutcome { emitted: steps.len(), next_watermark: None })
    }
}
