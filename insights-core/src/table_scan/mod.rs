//! Table scans distributed over the queue.
//!
//! A table scan walks every entity under a partition key prefix with the
//! [`TablePrefixScanner`](crate::storage::TablePrefixScanner), one step per
//! queue message. Each step either hands its rows to a [`TableScanDriver`]
//! or enqueues the steps it produced. Pending steps are tracked as task
//! states, so the scan is complete once its task-state partition is empty.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{InsightsError, Result},
    messages::Message,
    queue::QueueKind,
    scan::ScanId,
    storage::{PrefixScanStep, TableEntity},
};

pub mod copy;
pub mod processor;
pub mod service;

pub use copy::{TableCopyDriver, TableCopyParameters};
pub use processor::TableScanStepProcessor;
pub use service::{TableScan, TableScanService};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum TableScanDriverType {
    TableCopy,
}

impl TableScanDriverType {
    pub const ALL: [TableScanDriverType; 1] = [TableScanDriverType::TableCopy];

    pub fn as_str(self) -> &'static str {
        match self {
            TableScanDriverType::TableCopy => "TableCopy",
        }
    }
}

impl fmt::Display for TableScanDriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableScanDriverType {
    type Err = InsightsError;

    fn from_str(value: &str) -> Result<Self> {
        TableScanDriverType::ALL
            .into_iter()
            .find(|driver| driver.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| {
                InsightsError::InvalidArgument(format!("unknown table scan driver '{value}'"))
            })
    }
}

/// How many backend segments one step may fetch before it hands the rest of
/// its range to a new message. The first prefix is usually kept small so
/// work fans out quickly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TablePrefixScanStartParameters {
    #[serde(rename = "sf")]
    pub segments_per_first_prefix: usize,
    #[serde(rename = "ss")]
    pub segments_per_subsequent_prefix: usize,
}

impl Default for TablePrefixScanStartParameters {
    fn default() -> Self {
        Self {
            segments_per_first_prefix: 1,
            segments_per_subsequent_prefix: 1,
        }
    }
}

impl TablePrefixScanStartParameters {
    pub fn segments_for(&self, step: &PrefixScanStep) -> usize {
        if step.depth() == 0 {
            self.segments_per_first_prefix
        } else {
            self.segments_per_subsequent_prefix
        }
    }
}

/// Does something with the rows a table scan visits.
#[async_trait]
pub trait TableScanDriver: Send + Sync {
    fn driver_type(&self) -> TableScanDriverType;

    /// Runs once when a scan starts.
    async fn initialize(&self, _parameters: &Value) -> Result<()> {
        Ok(())
    }

    /// May see the same rows again after a redelivery.
    async fn process_entities(
        &self,
        parameters: &Value,
        entities: Vec<TableEntity>,
    ) -> Result<()>;
}

/// One prefix scan step of a table scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableScanMessage {
    pub driver_type: TableScanDriverType,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    /// Row key of the task state tracking this step.
    pub task_row_key: String,
    pub source_table: String,
    pub step: PrefixScanStep,
    pub start: TablePrefixScanStartParameters,
    #[serde(default)]
    pub driver_parameters: Value,
}

impl Message for TableScanMessage {
    const SCHEMA: &'static str = "tps";
    const QUEUE: QueueKind = QueueKind::Expand;
}
