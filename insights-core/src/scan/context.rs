use std::{fmt, sync::Arc, time::Duration};

use super::{driver::DriverRegistry, storage::CatalogScanStorage};
use crate::{
    catalog::{CatalogClient, RemoteCursorClient},
    config::ScanConfig,
    cursor::CursorStore,
    queue::MessageEnqueuer,
    storage::{TablePrefixScanner, TaskStateStore},
};

/// Everything the scan service and its message processors share.
#[derive(Clone)]
pub struct CatalogScanContext {
    pub drivers: Arc<DriverRegistry>,
    pub storage: CatalogScanStorage,
    pub cursors: CursorStore,
    pub task_states: TaskStateStore,
    pub catalog: Arc<dyn CatalogClient>,
    pub remote_cursors: Arc<dyn RemoteCursorClient>,
    pub enqueuer: Arc<MessageEnqueuer>,
    pub config: ScanConfig,
}

impl fmt::Debug for CatalogScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogScanContext")
            .field("drivers", &self.drivers.types())
            .field("storage", &self.storage)
            .field("cursors", &self.cursors)
            .field("task_states", &self.task_states)
            .field("catalog", &"CatalogClient")
            .field("remote_cursors", &"RemoteCursorClient")
            .field("enqueuer", &self.enqueuer)
            .field("config", &self.config)
            .finish()
    }
}

impl CatalogScanContext {
    pub fn prefix_scanner(&self) -> TablePrefixScanner {
        TablePrefixScanner::new(Arc::clone(self.storage.store()))
            .with_take_count(self.config.prefix_scan_take_count)
    }

    /// Delay before re-checking a waiting index scan.
    pub fn poll_delay(&self, attempt_count: u32) -> Duration {
        Duration::from_secs(u64::from(attempt_count).min(self.config.max_poll_delay_secs))
    }
}
