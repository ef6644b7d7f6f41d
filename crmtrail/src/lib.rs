//! # crmtrail
//!
//! Incremental extraction of CRM log and audit tables into telemetry events.
//!
//! Every job reads its watermark, plans the time window of the run, queries
//! the backend through the first working connection candidate, flattens the
//! records into events and advances the watermark once the events are
//! delivered:
//! - log tails (plugin traces, system jobs, workflow logs)
//! - fixed-window created/modified/total statistics per tracked entity
//! - snapshots of record counts, workflow definitions and plugin step states
//!
//! Jobs run on an interval inside actix actors or once from the command line.

#![warn(unsafe_code)]
#![warn(missing_docs)]

pub mod collector;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dataverse;
pub mod gateway;
pub mod jobs;
pub mod planner;
pub mod scheduler;
pub mod telemetry;

use std::sync::Arc;

pub use crmtrail_core::{CrmTrailError, Result};
pub use config::AppConfig;
pub use coordinator::{JobPolicy, RunCoordinator, RunReport, RunState};
pub use gateway::{BackendClient, BackendGateway};
pub use planner::{ExtractionWindow, WindowDecision, WindowPolicy};

use crmtrail_state::{BlobCredentials, BlobStateStore, FileStateStore, MemoryStateStore, StateStore};

use crate::config::StorageConfig;
use crate::dataverse::DataverseClient;

/// Version of crmtrail
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG`, defaulting to `default_level`
pub fn init_logging(default_level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
}

/// Open the state store described by `config`
pub fn build_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    Ok(match config {
        StorageConfig::Memory => Arc::new(MemoryStateStore::new()),
        StorageConfig::File { dir } => Arc::new(FileStateStore::new(dir.clone())),
        StorageConfig::Blob { account_name, container, sas_token, access_key } => {
            let credentials = match (sas_token, access_key) {
                (Some(token), _) => BlobCredentials::SasToken(token.clone()),
                (None, Some(key)) => BlobCredentials::AccessKey(key.clone()),
                (None, None) => {
                    return Err(CrmTrailError::Config("Blob storage needs a sas_token or an access_key".into()))
                }
            };
            Arc::new(BlobStateStore::new(account_name.as_str(), container.as_str(), credentials)?)
        }
    })
}

/// Build a coordinator talking to Dataverse with the given store
pub fn build_coordinator(config: &AppConfig, store: Arc<dyn StateStore>) -> Result<RunCoordinator> {
    let sink = telemetry::sink_from_config(&config.telemetry, config.backend.timeout())?;

    let backend = config.backend.clone();
    let client_factory: coordinator::ClientFactory = Arc::new(move || {
        let client: Arc<dyn BackendClient> = Arc::new(DataverseClient::new(&backend)?);
        Ok(client)
    });

    Ok(RunCoordinator::new(
        config.project_name.clone(),
        config.backend.connection_document.clone(),
        store,
        sink,
        client_factory,
    ))
}
