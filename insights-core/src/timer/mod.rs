//! Periodic jobs run under a cluster-wide lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Result, storage::TableRow};

pub mod catalog_scan_update;
pub mod service;

pub use catalog_scan_update::CatalogScanUpdateTimer;
pub use service::{TimerExecutionService, TimerState};

#[async_trait]
pub trait Timer: Send + Sync {
    /// Unique across all registered timers.
    fn name(&self) -> &str;

    fn frequency(&self) -> Duration;

    /// Whether the timer runs the first time it is seen, before anyone
    /// enables it.
    fn auto_start(&self) -> bool;

    /// Static enablement, typically from configuration.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Timers with a lower order run first; equal orders run concurrently.
    fn order(&self) -> i32 {
        0
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Returns whether any work was started.
    async fn execute(&self) -> Result<bool>;

    async fn is_running(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Persisted per-timer state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntity {
    pub name: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub last_executed: Option<DateTime<Utc>>,
}

impl TableRow for TimerEntity {
    fn partition_key(&self) -> String {
        String::new()
    }

    fn row_key(&self) -> String {
        self.name.clone()
    }
}
