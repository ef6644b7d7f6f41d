//! Shared fixtures: an in-process backend that evaluates the query model
//! against canned records.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crmtrail::connection::ConnectionCandidate;
use crmtrail::coordinator::ClientFactory;
use crmtrail::telemetry::MemorySink;
use crmtrail::{BackendClient, RunCoordinator};
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::query::{ColumnSet, Condition, ConditionOperator, FilterExpression, LogicalOperator, QueryExpression};
use crmtrail_core::record::BackendRecord;
use crmtrail_core::value::{parse_backend_timestamp, AttributeValue};
use crmtrail_state::{MemoryStateStore, StateStore};

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
}

pub fn connection_document(users: usize) -> String {
    let users: Vec<String> = (0..users)
        .map(|i| format!(r#"{{"clientId": "app-{}", "clientSecret": "secret-{}"}}"#, i, i))
        .collect();
    format!(r#"{{"backendUrl": "https://contoso.crm4.dynamics.com/", "users": [{}]}}"#, users.join(","))
}

/// Record with an id, `createdon` and `modifiedon`
pub fn row(entity: &str, id: &str, created: DateTime<Utc>, modified: DateTime<Utc>) -> BackendRecord {
    BackendRecord::new(entity)
        .with_attribute(format!("{}id", entity), AttributeValue::plain(id))
        .with_attribute("createdon", AttributeValue::plain(created.to_rfc3339()))
        .with_attribute("modifiedon", AttributeValue::plain(modified.to_rfc3339()))
}

#[derive(Default)]
pub struct ScriptedBackend {
    records: Mutex<HashMap<String, Vec<BackendRecord>>>,
    counts: Mutex<HashMap<String, u64>>,
    failing_entities: Mutex<HashSet<String>>,
    rejected_candidates: Mutex<HashSet<usize>>,
    fail_counts: Mutex<bool>,
    omitted_attributes: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(usize, String)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_records(&self, records: Vec<BackendRecord>) {
        let mut stored = self.records.lock().unwrap();
        for record in records {
            stored.entry(record.entity_name.clone()).or_default().push(record);
        }
    }

    pub fn set_count(&self, entity: &str, count: u64) {
        self.counts.lock().unwrap().insert(entity.to_string(), count);
    }

    pub fn fail_entity(&self, entity: &str) {
        self.failing_entities.lock().unwrap().insert(entity.to_string());
    }

    pub fn reject_candidate(&self, index: usize) {
        self.rejected_candidates.lock().unwrap().insert(index);
    }

    pub fn fail_counts(&self) {
        *self.fail_counts.lock().unwrap() = true;
    }

    /// Drop `attribute` from returned rows after filtering and sorting
    pub fn omit_attribute(&self, attribute: &str) {
        self.omitted_attributes.lock().unwrap().insert(attribute.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// (candidate index, operation) of every call, in order
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> ClientFactory {
        let backend = self.clone();
        Arc::new(move || {
            let client: Arc<dyn BackendClient> = backend.clone();
            Ok(client)
        })
    }

    async fn enter(&self, candidate: &ConnectionCandidate, operation: String) -> Result<()> {
        self.calls.lock().unwrap().push((candidate.index, operation));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.rejected_candidates.lock().unwrap().contains(&candidate.index) {
            return Err(CrmTrailError::Connection(format!("candidate {} rejected", candidate.index)));
        }
        Ok(())
    }
}

fn matches_condition(record: &BackendRecord, condition: &Condition) -> bool {
    let value = condition.values.first().map(String::as_str).unwrap_or_default();
    match condition.operator {
        ConditionOperator::GreaterEqual | ConditionOperator::LessThan | ConditionOperator::LessEqual => {
            let (Some(actual), Some(bound)) = (record.timestamp(&condition.attribute), parse_backend_timestamp(value))
            else {
                return false;
            };
            match condition.operator {
                ConditionOperator::GreaterEqual => actual >= bound,
                ConditionOperator::LessThan => actual < bound,
                _ => actual <= bound,
            }
        }
        ConditionOperator::Equal => record.get(&condition.attribute).map(|v| v.raw()).as_deref() == Some(value),
        ConditionOperator::NotEqual => record.get(&condition.attribute).map(|v| v.raw()).as_deref() != Some(value),
        ConditionOperator::In => record
            .get(&condition.attribute)
            .map(|v| condition.values.contains(&v.raw()))
            .unwrap_or(false),
        ConditionOperator::LastXDays(_) | ConditionOperator::Today => true,
    }
}

fn matches_filter(record: &BackendRecord, filter: &FilterExpression) -> bool {
    let conditions = filter.conditions.iter().map(|c| matches_condition(record, c));
    let filters = filter.filters.iter().map(|f| matches_filter(record, f));
    let mut results = conditions.chain(filters).peekable();
    if results.peek().is_none() {
        return true;
    }
    match filter.logical {
        LogicalOperator::And => results.all(|r| r),
        LogicalOperator::Or => results.any(|r| r),
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn retrieve_multiple(
        &self,
        candidate: &ConnectionCandidate,
        query: &QueryExpression,
    ) -> Result<Vec<BackendRecord>> {
        self.enter(candidate, query.describe()).await?;

        if self.failing_entities.lock().unwrap().contains(&query.entity_name) {
            return Err(CrmTrailError::Query(format!("{} is not queryable", query.entity_name)));
        }

        let stored = self.records.lock().unwrap().get(&query.entity_name).cloned().unwrap_or_default();
        let mut rows: Vec<BackendRecord> = stored
            .into_iter()
            .filter(|record| matches_filter(record, &query.criteria))
            .collect();

        if query.orders.iter().any(|order| order.attribute == "createdon") {
            rows.sort_by_key(|record| record.timestamp("createdon"));
        }
        if let Some(top) = query.top {
            rows.truncate(top as usize);
        }

        let omitted = self.omitted_attributes.lock().unwrap().clone();
        for record in &mut rows {
            if let ColumnSet::Columns(columns) = &query.columns {
                record.attributes.retain(|name, _| columns.contains(name));
            }
            record.attributes.retain(|name, _| !omitted.contains(name));
        }
        Ok(rows)
    }

    async fn retrieve_total_record_count(
        &self,
        candidate: &ConnectionCandidate,
        entity_names: &[String],
    ) -> Result<HashMap<String, u64>> {
        self.enter(candidate, format!("RetrieveTotalRecordCount({})", entity_names.join(","))).await?;

        if *self.fail_counts.lock().unwrap() {
            return Err(CrmTrailError::Query("count service down".into()));
        }
        let counts = self.counts.lock().unwrap();
        Ok(entity_names
            .iter()
            .filter_map(|name| counts.get(name).map(|count| (name.clone(), *count)))
            .collect())
    }
}

pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemoryStateStore>,
    pub sink: Arc<MemorySink>,
    pub coordinator: RunCoordinator,
}

impl Harness {
    pub fn new(users: usize) -> Self {
        Self::with_document(Some(connection_document(users)))
    }

    pub fn with_document(document: Option<String>) -> Self {
        let backend = ScriptedBackend::new();
        let store = Arc::new(MemoryStateStore::new());
        let sink = Arc::new(MemorySink::new());
        let coordinator = RunCoordinator::new(
            "contoso",
            document,
            store.clone() as Arc<dyn StateStore>,
            sink.clone(),
            backend.factory(),
        );
        Self { backend, store, sink, coordinator }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.store.save_raw(key, value).await.unwrap();
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.store.load_raw(key).await.unwrap()
    }
}
