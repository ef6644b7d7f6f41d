//! Telemetry sinks
//!
//! Events and exceptions produced by a run are buffered by its
//! [`RunTelemetry`] and handed to the shared [`TelemetrySink`] as one batch
//! on `flush`. A run only advances its checkpoint after its own batch was
//! sent; a failed send leaves the batch in the run's buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::TelemetryConfig;

/// Log target of [`LogSink`]
pub const TELEMETRY_TARGET: &str = "crmtrail::telemetry";

/// Property carrying the run's session id
pub const SESSION_ID_KEY: &str = "ai_session_id";

/// One buffered telemetry item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryItem {
    /// Custom event
    Event {
        /// Event name
        name: String,
        /// Event properties
        properties: HashMap<String, String>,
    },
    /// Exception report
    Exception {
        /// Error message
        message: String,
        /// Context properties
        properties: HashMap<String, String>,
    },
}

impl TelemetryItem {
    /// Event name, or the message of an exception
    pub fn name(&self) -> &str {
        match self {
            TelemetryItem::Event { name, .. } => name,
            TelemetryItem::Exception { message, .. } => message,
        }
    }

    /// Properties of the item
    pub fn properties(&self) -> &HashMap<String, String> {
        match self {
            TelemetryItem::Event { properties, .. } | TelemetryItem::Exception { properties, .. } => properties,
        }
    }
}

/// Destination for run events, shared by concurrent runs
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one batch; on error nothing of the batch counts as delivered
    async fn send(&self, items: &[TelemetryItem]) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn send(&self, items: &[TelemetryItem]) -> Result<()> {
        for item in items {
            let properties = serde_json::to_string(item.properties()).unwrap_or_default();
            match item {
                TelemetryItem::Event { name, .. } => info!(target: TELEMETRY_TARGET, "{} {}", name, properties),
                TelemetryItem::Exception { message, .. } => {
                    error!(target: TELEMETRY_TARGET, "{} {}", message, properties)
                }
            }
        }
        Ok(())
    }
}

/// Keeps every item in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<TelemetryItem>>,
    fail_flush: AtomicBool,
    fail_next: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail (or succeed again)
    pub fn set_flush_failure(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail, then succeed again
    pub fn fail_next_flushes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Items delivered by successful sends
    pub fn delivered(&self) -> Vec<TelemetryItem> {
        lock(&self.delivered).clone()
    }

    /// Names of delivered events, in order
    pub fn event_names(&self) -> Vec<String> {
        lock(&self.delivered)
            .iter()
            .filter(|item| matches!(item, TelemetryItem::Event { .. }))
            .map(|item| item.name().to_string())
            .collect()
    }

    /// Number of send calls
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn send(&self, items: &[TelemetryItem]) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let fail_once = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail_once || self.fail_flush.load(Ordering::SeqCst) {
            return Err(CrmTrailError::Telemetry("Memory sink configured to fail".into()));
        }
        lock(&self.delivered).extend_from_slice(items);
        Ok(())
    }
}

/// Sends items to Application Insights through the ingestion endpoint
pub struct AppInsightsSink {
    http_client: reqwest::Client,
    endpoint: String,
    instrumentation_key: String,
}

impl AppInsightsSink {
    /// Default ingestion endpoint
    pub const DEFAULT_ENDPOINT: &'static str = "https://dc.services.visualstudio.com";

    /// Create a sink for `instrumentation_key`
    pub fn new<E: Into<String>, K: Into<String>>(endpoint: E, instrumentation_key: K, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrmTrailError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            instrumentation_key: instrumentation_key.into(),
        })
    }

    fn envelope(&self, item: &TelemetryItem) -> serde_json::Value {
        let (base_type, mut base_data) = match item {
            TelemetryItem::Event { name, .. } => ("EventData", json!({ "ver": 2, "name": name })),
            TelemetryItem::Exception { message, .. } => (
                "ExceptionData",
                json!({
                    "ver": 2,
                    "exceptions": [{ "typeName": "CrmTrailError", "message": message, "hasFullStack": false }],
                }),
            ),
        };
        let properties = item.properties();
        let mut tags = serde_json::Map::new();
        if let Some(session_id) = properties.get(SESSION_ID_KEY) {
            tags.insert("ai.session.id".into(), json!(session_id));
        }
        base_data["properties"] = json!(properties);

        let kind = base_type.trim_end_matches("Data");
        json!({
            "name": format!("Microsoft.ApplicationInsights.{}.{}", self.instrumentation_key.replace('-', ""), kind),
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "iKey": self.instrumentation_key,
            "tags": tags,
            "data": { "baseType": base_type, "baseData": base_data },
        })
    }
}

#[async_trait]
impl TelemetrySink for AppInsightsSink {
    async fn send(&self, items: &[TelemetryItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let items: Vec<serde_json::Value> = items.iter().map(|item| self.envelope(item)).collect();

        let url = format!("{}/v2/track", self.endpoint);
        debug!("Sending {} telemetry item(s) to {}", items.len(), url);

        let response = self
            .http_client
            .post(&url)
            .json(&items)
            .send()
            .await
            .map_err(|e| CrmTrailError::Telemetry(format!("Failed to send telemetry: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "Could not read response body".to_string());
            warn!("Telemetry ingestion rejected {} item(s): {}", items.len(), status);
            return Err(CrmTrailError::Telemetry(format!("Ingestion responded with {}: {}", status, text)));
        }
        Ok(())
    }
}

/// Build the sink described by `config`
pub fn sink_from_config(config: &TelemetryConfig, timeout: Duration) -> Result<Arc<dyn TelemetrySink>> {
    Ok(match config {
        TelemetryConfig::Log => Arc::new(LogSink),
        TelemetryConfig::AppInsights { instrumentation_key, endpoint } => Arc::new(AppInsightsSink::new(
            endpoint.as_deref().unwrap_or(AppInsightsSink::DEFAULT_ENDPOINT),
            instrumentation_key.clone(),
            timeout,
        )?),
    })
}

/// Telemetry of one run: every item carries the run's session id, project
/// and job name, and stays in the run's own buffer until a send succeeds
#[derive(Clone)]
pub struct RunTelemetry {
    sink: Arc<dyn TelemetrySink>,
    session_id: Uuid,
    context: HashMap<String, String>,
    buffer: Arc<Mutex<Vec<TelemetryItem>>>,
}

impl RunTelemetry {
    /// Start a new telemetry session for `service` in `project`
    pub fn new(sink: Arc<dyn TelemetrySink>, project: &str, service: &str) -> Self {
        let session_id = Uuid::new_v4();
        let context = HashMap::from([
            (SESSION_ID_KEY.to_string(), session_id.to_string()),
            ("project".to_string(), project.to_string()),
            ("service".to_string(), service.to_string()),
        ]);
        Self { sink, session_id, context, buffer: Arc::default() }
    }

    /// Session id of this run
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn with_context(&self, mut properties: HashMap<String, String>) -> HashMap<String, String> {
        for (key, value) in &self.context {
            properties.entry(key.clone()).or_insert_with(|| value.clone());
        }
        properties
    }

    /// Record an event
    pub fn event(&self, name: &str, properties: HashMap<String, String>) {
        let properties = self.with_context(properties);
        lock(&self.buffer).push(TelemetryItem::Event { name: name.to_string(), properties });
    }

    /// Record an exception
    pub fn exception(&self, message: &str, properties: HashMap<String, String>) {
        let properties = self.with_context(properties);
        lock(&self.buffer).push(TelemetryItem::Exception { message: message.to_string(), properties });
    }

    /// Items recorded and not yet delivered
    pub fn pending(&self) -> Vec<TelemetryItem> {
        lock(&self.buffer).clone()
    }

    /// Deliver everything this run recorded so far
    pub async fn flush(&self) -> Result<()> {
        let batch: Vec<TelemetryItem> = lock(&self.buffer).drain(..).collect();
        if let Err(e) = self.sink.send(&batch).await {
            let mut buffer = lock(&self.buffer);
            let newer = std::mem::replace(&mut *buffer, batch);
            buffer.extend(newer);
            return Err(e);
        }
        Ok(())
    }
}
