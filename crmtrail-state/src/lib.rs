//! # crmtrail State
//!
//! Watermark checkpoints for crmtrail jobs and the key/value stores that hold
//! them (in memory, on local disk, or in an Azure blob container).

#![warn(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod storage;
pub mod watermark;

// Re-exports for convenience
pub use checkpoint::Checkpoint;
pub use storage::{BlobCredentials, BlobStateStore, FileStateStore, MemoryStateStore, StateStore, StateStoreExt};
pub use watermark::{format_watermark, parse_watermark};

/// Version of the crmtrail state crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
