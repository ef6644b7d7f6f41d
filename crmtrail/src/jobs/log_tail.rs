//! Log tail jobs
//!
//! Follow an append-only log table by creation time. Each record becomes one
//! event. When a chunk limit cuts the result short, the watermark moves to the
//! last emitted record instead of the window end so the rest is picked up by
//! the next run. A full chunk that cannot move the watermark fails the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::flatten::RecordFlattener;
use crmtrail_core::query::{format_timestamp, ColumnSet, Condition, ConditionOperator, LinkEntity, QueryExpression};
use crmtrail_core::record::BackendRecord;
use log::{debug, error, info};

use crate::config::LogTailOptions;
use crate::coordinator::{JobContext, JobOutcome, JobPolicy};
use crate::planner::{ExtractionWindow, WindowPolicy};

const CREATED_ON: &str = "createdon";

const WORKFLOW_LOG_COLUMNS: &[&str] = &[
    "activityname",
    "asyncoperationid",
    "childworkflowinstanceid",
    "completedon",
    "createdby",
    "createdon",
    "createdonbehalfby",
    "description",
    "duration",
    "errorcode",
    "errortext",
    "iterationcount",
    "message",
    "modifiedby",
    "modifiedon",
    "modifiedonbehalfby",
    "regardingobjectid",
    "repetitioncount",
    "repetitionid",
    "stagename",
    "startedon",
    "status",
    "stepname",
    "workflowlogid",
];

/// Tail of one log table
#[derive(Debug, Clone)]
pub struct LogTailJob {
    name: String,
    stream_key: String,
    entity_name: String,
    event_name: String,
    columns: ColumnSet,
    conditions: Vec<Condition>,
    links: Vec<LinkEntity>,
    top: Option<u32>,
    distinct: bool,
    flattener: RecordFlattener,
}

impl LogTailJob {
    /// Tail `entity_name`, emitting one `event_name` event per record
    pub fn new(
        name: impl Into<String>,
        stream_key: impl Into<String>,
        entity_name: impl Into<String>,
        event_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let entity_name = entity_name.into();
        Self {
            name: name.into(),
            stream_key: stream_key.into(),
            flattener: RecordFlattener::new(entity_name.clone(), version),
            entity_name,
            event_name: event_name.into(),
            columns: ColumnSet::All,
            conditions: Vec::new(),
            links: Vec::new(),
            top: None,
            distinct: false,
        }
    }

    /// Plugin trace log preset
    pub fn plugin_trace_log(name: &str, stream_key: &str, version: &str, options: &LogTailOptions) -> Self {
        Self::new(name, stream_key, "plugintracelog", "Log trace record", version).with_options(options)
    }

    /// System job preset: workflow-type async operations of the last 30 days
    pub fn system_job_log(name: &str, stream_key: &str, version: &str, options: &LogTailOptions) -> Self {
        let job = Self::new(name, stream_key, "asyncoperation", "System job record", version)
            .with_condition(Condition::equal("operationtype", "1"));
        let job = match options.last_x_days {
            Some(_) => job,
            None => job.with_condition(Condition::last_x_days(CREATED_ON, 30)),
        };
        job.with_options(options)
    }

    /// Workflow log preset, joined to the owning workflow through its async operation
    pub fn workflow_log(name: &str, stream_key: &str, version: &str, options: &LogTailOptions) -> Self {
        let workflow = LinkEntity::inner("workflow", "workflowid", "workflowactivationid", "wf")
            .with_columns(["name", "workflowid"]);
        let operation = LinkEntity::inner("asyncoperation", "asyncoperationid", "asyncoperationid", "ao")
            .with_link(workflow);

        Self::new(name, stream_key, "workflowlog", "Workflow log record", version)
            .with_columns(ColumnSet::columns(WORKFLOW_LOG_COLUMNS.iter().copied()))
            .with_link(operation)
            .distinct()
            .with_options(options)
    }

    fn with_options(mut self, options: &LogTailOptions) -> Self {
        if let Some(columns) = &options.columns {
            self = self.with_columns(ColumnSet::columns(columns.iter().cloned()));
        }
        if let Some(days) = options.last_x_days {
            self.conditions.push(Condition::last_x_days(CREATED_ON, days));
        }
        if let Some(top) = options.top {
            self.top = Some(top);
        }
        self
    }

    /// Restrict the returned columns; `createdon` is always kept
    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = match columns {
            ColumnSet::Columns(mut names) => {
                if !names.iter().any(|name| name == CREATED_ON) {
                    names.push(CREATED_ON.to_string());
                }
                ColumnSet::Columns(names)
            }
            ColumnSet::All => ColumnSet::All,
        };
        self
    }

    /// Add a filter condition
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an inner join
    pub fn with_link(mut self, link: LinkEntity) -> Self {
        self.links.push(link);
        self
    }

    /// Limit the rows per run
    pub fn with_top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Remove duplicate rows
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Query for one window
    pub fn query(&self, window: &ExtractionWindow) -> QueryExpression {
        let mut query = QueryExpression::new(&self.entity_name)
            .with_columns(self.columns.clone())
            .with_condition(Condition::at(CREATED_ON, ConditionOperator::GreaterEqual, window.start()))
            .with_condition(Condition::at(CREATED_ON, ConditionOperator::LessThan, window.end()))
            .with_order(CREATED_ON, false);

        for condition in &self.conditions {
            query = query.with_condition(condition.clone());
        }
        for link in &self.links {
            query = query.with_link(link.clone());
        }
        if let Some(top) = self.top {
            query = query.with_top(top);
        }
        if self.distinct {
            query = query.distinct();
        }
        query
    }
}

impl LogTailJob {
    /// Watermark after a full chunk: creation time of its last record, which
    /// must lie past the window start
    fn chunk_watermark(&self, records: &[BackendRecord], window: &ExtractionWindow) -> Result<DateTime<Utc>> {
        let last = records.last().and_then(|record| record.timestamp(CREATED_ON)).ok_or_else(|| {
            CrmTrailError::Query(format!(
                "{}: chunk of {} {} record(s) was full but the last record has no {}",
                self.name,
                records.len(),
                self.entity_name,
                CREATED_ON
            ))
        })?;

        if last <= window.start() {
            error!(
                "{}: all {} record(s) of a full chunk were created at {}; raise top to move past them",
                self.name,
                records.len(),
                format_timestamp(&window.start())
            );
            return Err(CrmTrailError::Query(format!(
                "{}: full chunk does not move the watermark past {}",
                self.name,
                format_timestamp(&window.start())
            )));
        }
        Ok(last)
    }
}

#[async_trait]
impl JobPolicy for LogTailJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::UnboundedForward
    }

    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome> {
        let window = context.require_window()?;
        let query = self.query(&window);
        debug!("{}: {}", self.name, query.to_fetch_xml());

        let records = context.gateway.retrieve_multiple(&query).await?;
        info!("{}: retrieved {} {} record(s) in {}", self.name, records.len(), self.entity_name, window);

        let truncated = self.top.map_or(false, |top| records.len() >= top as usize);
        let next_watermark = if truncated { Some(self.chunk_watermark(&records, &window)?) } else { None };

        for record in &records {
            context
                .telemetry
                .event(&self.event_name, self.flattener.flatten(record).into_properties());
        }

        Ok(JobOutcome { emitted: records.len(), next_watermark })
    }
}
