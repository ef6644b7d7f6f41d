//! Checkpoint module
//!
//! A `Checkpoint` owns the watermark of one logical stream. Reading a
//! watermark that does not parse is a configuration error; advancing never
//! moves a watermark backwards.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use log::{debug, info};

use crate::storage::StateStore;
use crate::watermark::{format_watermark, parse_watermark};

/// Watermark of one logical stream
#[derive(Clone)]
pub struct Checkpoint {
    stream: String,
    store: Arc<dyn StateStore>,
}

impl Checkpoint {
    /// Create a checkpoint for `stream` in `store`
    pub fn new<S: Into<String>>(stream: S, store: Arc<dyn StateStore>) -> Self {
        Self { stream: stream.into(), store }
    }

    /// Stream (store key) of this checkpoint
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Read the current watermark; absent or blank means no watermark yet
    pub async fn read(&self) -> Result<Option<DateTime<Utc>>> {
        match self.store.load_raw(&self.stream).await? {
            Some(text) if !text.trim().is_empty() => {
                let watermark = parse_watermark(&text).map_err(|e| {
                    CrmTrailError::Config(format!("Checkpoint '{}': {}", self.stream, e))
                })?;
                debug!("Checkpoint {} at {}", self.stream, format_watermark(&watermark));
                Ok(Some(watermark))
            }
            _ => {
                debug!("Checkpoint {} has no watermark", self.stream);
                Ok(None)
            }
        }
    }

    /// Move the watermark forward to `next`
    pub async fn advance(&self, next: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.read().await? {
            if next < current {
                return Err(CrmTrailError::State(format!(
                    "Checkpoint '{}' would move backwards from {} to {}",
                    self.stream,
                    format_watermark(&current),
                    format_watermark(&next)
                )));
            }
        }

        self.store.save_raw(&self.stream, &format_watermark(&next)).await?;
        info!("Checkpoint {} advanced to {}", self.stream, format_watermark(&next));
        Ok(())
    }

    /// Overwrite the watermark unconditionally (operator bootstrap / rewind)
    pub async fn reset(&self, watermark: DateTime<Utc>) -> Result<()> {
        self.store.save_raw(&self.stream, &format_watermark(&watermark)).await?;
        info!("Checkpoint {} reset to {}", self.stream, format_watermark(&watermark));
        Ok(())
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint").field("stream", &self.stream).finish()
    }
}
