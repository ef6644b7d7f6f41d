//! Entity delta statistics
//!
//! For every tracked entity and one extraction window the collector gathers
//! the table's total record count and the number of rows created and modified
//! inside the window. A failed count is logged and left at zero so one bad
//! entity never blocks the others.

use std::collections::HashMap;

use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::query::{format_timestamp, ColumnSet, Condition, ConditionOperator, QueryExpression};
use crmtrail_core::record::ENTITY_NAME_KEY;
use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::gateway::BackendGateway;
use crate::planner::ExtractionWindow;

/// Entity type whose deltas are collected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Logical name
    pub name: String,
    /// Primary key attribute
    pub id_attribute: String,
}

impl TrackedEntity {
    /// Track `name` with the conventional `<name>id` key
    pub fn new<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        let id_attribute = format!("{}id", name);
        Self { name, id_attribute }
    }

    /// Override the primary key attribute
    pub fn with_id_attribute<S: Into<String>>(mut self, id_attribute: S) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrackedEntityEntry {
    Name(String),
    #[serde(rename_all = "camelCase")]
    Pair {
        #[serde(alias = "EntityName", alias = "name")]
        entity_name: String,
        #[serde(default, alias = "IdAttribute")]
        id_attribute: Option<String>,
    },
}

/// Parse the tracked-entity document.
///
/// Accepts a JSON array of names (`["account", "contact"]`) or of
/// `{entityName, idAttribute}` objects; both shapes may be mixed.
pub fn parse_tracked_entities(document: &str) -> Result<Vec<TrackedEntity>> {
    let entries: Vec<TrackedEntityEntry> = serde_json::from_str(document)
        .map_err(|e| CrmTrailError::Config(format!("Invalid tracked-entity document: {}", e)))?;

    entries
        .into_iter()
        .map(|entry| {
            let entity = match entry {
                TrackedEntityEntry::Name(name) => TrackedEntity::new(name.trim()),
                TrackedEntityEntry::Pair { entity_name, id_attribute } => {
                    let entity = TrackedEntity::new(entity_name.trim());
                    match id_attribute {
                        Some(id) if !id.trim().is_empty() => entity.with_id_attribute(id.trim()),
                        _ => entity,
                    }
                }
            };
            if entity.name.is_empty() {
                return Err(CrmTrailError::Config("Tracked-entity document contains an empty name".into()));
            }
            Ok(entity)
        })
        .collect()
}

/// Delta statistics of one entity over one window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDelta {
    /// Logical name
    pub entity_name: String,
    /// Window start
    pub window_start: chrono::DateTime<chrono::Utc>,
    /// Window end
    pub window_end: chrono::DateTime<chrono::Utc>,
    /// Rows in the table
    pub total_count: u64,
    /// Rows created inside the window
    pub created_count: u64,
    /// Rows modified inside the window
    pub modified_count: u64,
}

impl EntityDelta {
    /// Zero-count delta for `entity_name` over `window`
    pub fn new<S: Into<String>>(entity_name: S, window: &ExtractionWindow) -> Self {
        Self {
            entity_name: entity_name.into(),
            window_start: window.start(),
            window_end: window.end(),
            total_count: 0,
            created_count: 0,
            modified_count: 0,
        }
    }

    /// Event properties
    pub fn properties(&self) -> HashMap<String, String> {
        HashMap::from([
            (ENTITY_NAME_KEY.to_string(), self.entity_name.clone()),
            ("StartDate".to_string(), format_timestamp(&self.window_start)),
            ("EndDate".to_string(), format_timestamp(&self.window_end)),
            ("TotalRecordCount".to_string(), self.total_count.to_string()),
            ("CreatedCount".to_string(), self.created_count.to_string()),
            ("ModifiedCount".to_string(), self.modified_count.to_string()),
        ])
    }
}

/// Collects [`EntityDelta`]s through a [`BackendGateway`]
#[derive(Debug, Clone)]
pub struct EntityDeltaCollector {
    created_attribute: String,
    modified_attribute: String,
}

impl Default for EntityDeltaCollector {
    fn default() -> Self {
        Self::new("createdon", "modifiedon")
    }
}

impl EntityDeltaCollector {
    /// Collector comparing the window against the given timestamp attributes
    pub fn new<C: Into<String>, M: Into<String>>(created_attribute: C, modified_attribute: M) -> Self {
        Self {
            created_attribute: created_attribute.into(),
            modified_attribute: modified_attribute.into(),
        }
    }

    /// Collect one delta per entity, in input order
    pub async fn collect(
        &self,
        gateway: &BackendGateway,
        entities: &[TrackedEntity],
        window: &ExtractionWindow,
    ) -> Vec<EntityDelta> {
        if entities.is_empty() {
            return Vec::new();
        }

        let names: Vec<String> = entities.iter().map(|entity| entity.name.clone()).collect();
        let totals = match gateway.total_record_count(&names).await {
            Ok(totals) => totals,
            Err(e) => {
                warn!("Failed to fetch total record counts in {} for {}: {}", window, names.join(","), e);
                HashMap::new()
            }
        };

        join_all(entities.iter().map(|entity| {
            let total = totals.get(&entity.name).copied();
            self.collect_entity(gateway, entity, window, total)
        }))
        .await
    }

    async fn collect_entity(
        &self,
        gateway: &BackendGateway,
        entity: &TrackedEntity,
        window: &ExtractionWindow,
        total: Option<u64>,
    ) -> EntityDelta {
        let mut delta = EntityDelta::new(&entity.name, window);

        match total {
            Some(total) => delta.total_count = total,
            None => debug!("No total record count returned for {}", entity.name),
        }

        let (created, modified) = futures::join!(
            self.count(gateway, entity, window, &self.created_attribute, "created"),
            self.count(gateway, entity, window, &self.modified_attribute, "modified"),
        );
        delta.created_count = created;
        delta.modified_count = modified;

        debug!(
            "{} in {}: total {}, created {}, modified {}",
            entity.name, window, delta.total_count, delta.created_count, delta.modified_count
        );
        delta
    }

    async fn count(
        &self,
        gateway: &BackendGateway,
        entity: &TrackedEntity,
        window: &ExtractionWindow,
        attribute: &str,
        kind: &str,
    ) -> u64 {
        let query = QueryExpression::new(&entity.name)
            .with_columns(ColumnSet::columns([entity.id_attribute.as_str()]))
            .with_condition(Condition::at(attribute, ConditionOperator::GreaterEqual, window.start()))
            .with_condition(Condition::at(attribute, ConditionOperator::LessThan, window.end()));

        match gateway.retrieve_multiple(&query).await {
            Ok(records) => records.len() as u64,
            Err(e) => {
                warn!("Failed to count {} records of {} in {}: {}", kind, entity.name, window, e);
                0
            }
        }
    }
}
