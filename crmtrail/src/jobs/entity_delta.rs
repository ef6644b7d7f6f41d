//! Entity delta job
//!
//! Every fixed window, one "Entity delta" event per tracked entity with its
//! total, created and modified counts.

use async_trait::async_trait;
use chrono::Duration;
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::record::VERSION_KEY;
use log::info;

use crate::collector::{parse_tracked_entities, EntityDeltaCollector};
use crate::coordinator::{JobContext, JobOutcome, JobPolicy};
use crate::jobs::read_document;
use crate::planner::WindowPolicy;

/// Event name of one entity delta
pub const ENTITY_DELTA_EVENT: &str = "Entity delta";

/// Fixed-window delta statistics over the tracked entities
#[derive(Debug, Clone)]
pub struct EntityDeltaJob {
    name: String,
    stream_key: String,
    tracked_entities_key: String,
    window: Duration,
    version: String,
    collector: EntityDeltaCollector,
}

impl EntityDeltaJob {
    /// Create a job reading its tracked entities from `tracked_entities_key`
    pub fn new(
        name: impl Into<String>,
        stream_key: impl Into<String>,
        tracked_entities_key: impl Into<String>,
        window: Duration,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            stream_key: stream_key.into(),
            tracked_entities_key: tracked_entities_key.into(),
            window,
            version: version.into(),
            collector: EntityDeltaCollector::default(),
        }
    }

    /// Use another collector (e.g. custom timestamp attributes)
    pub fn with_collector(mut self, collector: EntityDeltaCollector) -> Self {
        self.collector = collector;
        self
    }
}

#[async_trait]
impl JobPolicy for EntityDeltaJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::FixedDuration(self.window)
    }

    async fn execute(&self, context: &JobContext<'_>) -> Result<JobOutcome> {
        let window = context.require_window()?;

        let document = read_document(context.store, &self.tracked_entities_key)
            .await?
            .ok_or_else(|| {
                CrmTrailError::Config(format!("Tracked-entity document '{}' is missing", self.tracked_entities_key))
            })?;
        let entities = parse_tracked_entities(&document)?;
        info!("{}: collecting {} entities in {}", self.name, entities.len(), window);

        let deltas = self.collector.collect(context.gateway, &entities, &window).await;
        for delta in &deltas {
            let mut properties = delta.properties();
            properties.insert(VERSION_KEY.to_string(), self.version.clone());
            context.telemetry.event(ENTITY_DELTA_EVENT, properties);
        }

        Ok(JobOutcome { emitted: deltas.len(), next_watermark: None })
    }
}
