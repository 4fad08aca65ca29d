use serde::{Deserialize, Serialize};

use super::model::{CatalogScanDriverType, ScanId};
use crate::{messages::Message, queue::QueueKind};

/// Advances one index scan's state machine. Re-enqueued with a growing
/// delay while the scan waits on its children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogIndexScanMessage {
    pub driver_type: CatalogScanDriverType,
    pub scan_id: ScanId,
    #[serde(default)]
    pub attempt_count: u32,
}

impl Message for CatalogIndexScanMessage {
    const SCHEMA: &'static str = "cis";
    const QUEUE: QueueKind = QueueKind::Expand;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPageScanMessage {
    pub storage_suffix: String,
    pub scan_id: ScanId,
    pub page_id: String,
}

impl Message for CatalogPageScanMessage {
    const SCHEMA: &'static str = "cps";
    const QUEUE: QueueKind = QueueKind::Expand;
}

/// Points at a leaf scan row; the row itself carries the work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogLeafScanMessage {
    pub storage_suffix: String,
    pub partition_key: String,
    pub leaf_id: String,
    /// Lowercase package id, used to keep a package's leaves in one batch.
    #[serde(default)]
    pub package_id: String,
}

impl Message for CatalogLeafScanMessage {
    const SCHEMA: &'static str = "cls";
    const QUEUE: QueueKind = QueueKind::Work;

    fn batch_key(&self) -> Option<String> {
        if self.package_id.is_empty() {
            None
        } else {
            Some(self.package_id.clone())
        }
    }
}

/// Aggregates one bucket of a scan; tracked by a task state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucketMessage {
    pub driver_type: CatalogScanDriverType,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    pub bucket: u32,
}

impl Message for AggregateBucketMessage {
    const SCHEMA: &'static str = "agg";
    const QUEUE: QueueKind = QueueKind::Work;
}
