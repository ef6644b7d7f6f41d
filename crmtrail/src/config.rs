//! Configuration
//!
//! `AppConfig` is loaded once from YAML and handed to every component by
//! reference. Nothing else in the crate reads the environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crmtrail_core::error::{CrmTrailError, Result};
use serde::{Deserialize, Serialize};

/// Main crmtrail configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Project name attached to every event
    pub project_name: String,

    /// Backend access
    pub backend: BackendConfig,

    /// Where watermarks and job documents live
    pub storage: StorageConfig,

    /// Where events go
    pub telemetry: TelemetryConfig,

    /// Scheduled jobs
    pub jobs: Vec<JobConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_name: "crmtrail".to_string(),
            backend: BackendConfig::default(),
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig::default(),
            jobs: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load the configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            CrmTrailError::Config(format!("Failed to open config file {}: {}", path.as_ref().display(), e))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| CrmTrailError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Load the configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CrmTrailError::Config(format!("Failed to parse config string: {}", e)))
    }

    /// Look up a job by name
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.project_name.trim().is_empty() {
            return Err(CrmTrailError::Config("project_name must not be empty".into()));
        }

        self.backend.validate()?;
        self.storage.validate()?;
        self.telemetry.validate()?;

        let mut names = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(CrmTrailError::Config(format!("Duplicate job name '{}'", job.name)));
            }
        }

        Ok(())
    }
}

/// Backend access settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Tenant connection document (JSON), kept raw
    pub connection_document: Option<String>,

    /// Azure AD tenant used for client-credential tokens
    pub tenant_id: Option<String>,

    /// Token authority
    pub authority_host: String,

    /// Web API version
    pub api_version: String,

    /// HTTP timeout (in milliseconds)
    pub timeout_ms: u64,

    /// Rows per page when paging through results
    pub page_size: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connection_document: None,
            tenant_id: None,
            authority_host: "https://login.microsoftonline.com".to_string(),
            api_version: "9.2".to_string(),
            timeout_ms: 30000,
            page_size: 5000,
        }
    }
}

impl BackendConfig {
    /// HTTP timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(CrmTrailError::Config("backend.timeout_ms must be positive".into()));
        }
        if self.page_size == 0 || self.page_size > 5000 {
            return Err(CrmTrailError::Config("backend.page_size must be between 1 and 5000".into()));
        }
        if reqwest::Url::parse(&self.authority_host).is_err() {
            return Err(CrmTrailError::Config(format!(
                "backend.authority_host '{}' is not a URL",
                self.authority_host
            )));
        }
        Ok(())
    }
}

/// State store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In memory, lost on exit
    Memory,
    /// One file per key under `dir`
    File {
        /// Base directory
        dir: PathBuf,
    },
    /// Azure blob container, authorised by a SAS token or an account key
    Blob {
        /// Storage account name
        account_name: String,
        /// Container name
        container: String,
        /// SAS token, with or without the leading `?`
        #[serde(default)]
        sas_token: Option<String>,
        /// Shared account key
        #[serde(default)]
        access_key: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File { dir: PathBuf::from("./state") }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::Memory => Ok(()),
            StorageConfig::File { dir } if dir.as_os_str().is_empty() => {
                Err(CrmTrailError::Config("storage.dir must not be empty".into()))
            }
            StorageConfig::File { .. } => Ok(()),
            StorageConfig::Blob { account_name, container, sas_token, access_key } => {
                if account_name.trim().is_empty() || container.trim().is_empty() {
                    return Err(CrmTrailError::Config("storage.account_name and storage.container are required".into()));
                }
                if sas_token.is_none() && access_key.is_none() {
                    return Err(CrmTrailError::Config("storage needs a sas_token or an access_key".into()));
                }
                Ok(())
            }
        }
    }
}

/// Telemetry sink selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryConfig {
    /// Write events to the log
    #[default]
    Log,
    /// Application Insights
    AppInsights {
        /// Instrumentation key of the resource
        instrumentation_key: String,
        /// Ingestion endpoint, defaults to the public one
        #[serde(default)]
        endpoint: Option<String>,
    },
}

impl TelemetryConfig {
    fn validate(&self) -> Result<()> {
        match self {
            TelemetryConfig::AppInsights { instrumentation_key, .. } if instrumentation_key.trim().is_empty() => {
                Err(CrmTrailError::Config("telemetry.instrumentation_key must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Longest entity delta window: one year
pub const MAX_WINDOW_MINUTES: u64 = 525_600;

fn default_schedule_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> String {
    "1.0".to_string()
}

/// One scheduled job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job name, also the telemetry service name
    pub name: String,

    /// Seconds between runs
    #[serde(default = "default_schedule_secs")]
    pub schedule_secs: u64,

    /// Disabled jobs are not scheduled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Value of the `Version` property of emitted records
    #[serde(default = "default_version")]
    pub version: String,

    /// Store key of the job's watermark, defaults to `<name>.watermark`
    #[serde(default)]
    pub checkpoint_key: Option<String>,

    /// What the job does
    #[serde(flatten)]
    pub kind: JobKind,
}

impl JobConfig {
    /// Store key of the job's watermark
    pub fn checkpoint_key(&self) -> String {
        self.checkpoint_key
            .clone()
            .unwrap_or_else(|| format!("{}.watermark", self.name))
    }

    /// Time between runs
    pub fn schedule(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CrmTrailError::Config("Job name must not be empty".into()));
        }
        if self.schedule_secs == 0 {
            return Err(CrmTrailError::Config(format!("Job '{}': schedule_secs must be positive", self.name)));
        }
        match &self.kind {
            JobKind::PluginTraceLog(options) | JobKind::SystemJobLog(options) | JobKind::WorkflowLog(options) => {
                if options.top == Some(0) {
                    return Err(CrmTrailError::Config(format!("Job '{}': top must be positive", self.name)));
                }
            }
            JobKind::EntityDelta { window_minutes, .. } if !(1..=MAX_WINDOW_MINUTES).contains(window_minutes) => {
                return Err(CrmTrailError::Config(format!(
                    "Job '{}': window_minutes must be between 1 and {}",
                    self.name, MAX_WINDOW_MINUTES
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Options shared by the log tail presets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogTailOptions {
    /// Rows per run; a full chunk advances the watermark to its last record
    pub top: Option<u32>,
    /// Replace the preset column list
    pub columns: Option<Vec<String>>,
    /// Replace the preset last-x-days guard
    pub last_x_days: Option<u32>,
}

fn default_tracked_entities_key() -> String {
    "trackedentities.json".to_string()
}

fn default_window_minutes() -> u64 {
    120
}

fn default_created_attribute() -> String {
    "createdon".to_string()
}

fn default_modified_attribute() -> String {
    "modifiedon".to_string()
}

fn default_entities_key() -> String {
    "entities.json".to_string()
}

/// Job kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Plugin trace log tail
    PluginTraceLog(LogTailOptions),
    /// System job (async operation) tail
    SystemJobLog(LogTailOptions),
    /// Workflow log tail
    WorkflowLog(LogTailOptions),
    /// Created/modified/total counts per tracked entity in fixed windows
    EntityDelta {
        /// Store key of the tracked-entity document
        #[serde(default = "default_tracked_entities_key")]
        tracked_entities_key: String,
        /// Window size
        #[serde(default = "default_window_minutes")]
        window_minutes: u64,
        /// Creation timestamp attribute
        #[serde(default = "default_created_attribute")]
        created_attribute: String,
        /// Modification timestamp attribute
        #[serde(default = "default_modified_attribute")]
        modified_attribute: String,
    },
    /// Total record counts of a list of entities
    RecordCount {
        /// Store key of the entity-name list
        #[serde(default = "default_entities_key")]
        entities_key: String,
    },
    /// Classic workflow definitions by name
    WorkflowInfo {
        /// Store key of the workflow-name list
        filter_key: String,
    },
    /// Power Automate flow definitions by name
    PowerAutomateFlow {
        /// Store key of the flow-name list
        filter_key: String,
    },
    /// Latest state of plugin steps
    PluginStepStatus {
        /// Store key of the `{"nameFilters": [...]}` document
        #[serde(default)]
        filter_key: Option<String>,
    },
}
