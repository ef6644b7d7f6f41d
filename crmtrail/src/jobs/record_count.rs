//! Record count job

use async_trait::async_trait;
use crmtrail_core::error::Result;
use crmtrail_core::record::{ENTITY_NAME_KEY, VERSION_KEY};
use std::collections::HashMap;

use crate::coordinator::{JobContext, JobOutcome, JobPolicy};
use crate::jobs::load_name_list;
use crate::planner::WindowPolicy;

/// Emits the total record count of every listed entity
#[derive(Debug, Clone)]
pub struct RecordCountJob {
    name: String,
    entities_key: String,
    version: String,
}

impl RecordCountJob {
    /// Create a job reading its entity list from `entities_key`
    pub fn new(name: impl Into<String>, entities_key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities_key: entities_key.into(),
            version: version.into(),
        }
    }
}

#[async_trait]
impl JobPolicy for RecordCountJob {
    fn name(&self) -> &str {
        &self.name
    }

    // snapshots keep no watermark
    fn stream_key(&self) -> &str {
        &self.name
    }

    fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::Unwindowed
    }

    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome> {
        let names = load_name_list(context.store, &self.entities_key).await?;

        let counts = if names.is_empty() {
            HashMap::new()
        } else {
            context.gateway.total_record_count(&names).await?
        };

        let base = HashMap::from([(VERSION_KEY.to_string(), self.version.clone())]);
        if counts.is_empty() {
            context.telemetry.event("EntityRecordCountCollection count: 0", base);
            return Ok(JobOutcome { emitted: 1, next_watermark: None });
        }

        let mut emitted = 0;
        for name in &names {
            let Some(count) = counts.get(name) else {
                continue;
            };
            let mut properties = base.clone();
            properties.insert(ENTITY_NAME_KEY.to_string(), name.clone());
            properties.insert("RecordCount".to_string(), count.to_string());
            context.telemetry.event(&format!("{} table has {} records.", name, count), properties);
            emitted += 1;
        }

        Ok(JobOutcome { emitted, next_watermark: None })
    }
}
