use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{
    TablePrefixScanStartParameters, TableScanDriver, TableScanDriverType, TableScanMessage,
};
use crate::{
    error::{InsightsError, Result},
    queue::MessageEnqueuer,
    scan::ScanId,
    storage::{TablePrefixScanner, TableStore, TaskStateStore},
};

/// Handle to a started table scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableScan {
    pub driver_type: TableScanDriverType,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    pub source_table: String,
    pub prefix: String,
}

impl TableScan {
    pub(crate) fn task_partition(&self) -> String {
        self.scan_id.to_string()
    }
}

pub struct TableScanService {
    store: Arc<dyn TableStore>,
    task_states: TaskStateStore,
    enqueuer: Arc<MessageEnqueuer>,
    drivers: BTreeMap<TableScanDriverType, Arc<dyn TableScanDriver>>,
    take_count: usize,
}

impl fmt::Debug for TableScanService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableScanService")
            .field("task_states", &self.task_states)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("take_count", &self.take_count)
            .finish()
    }
}

impl TableScanService {
    pub fn new(
        store: Arc<dyn TableStore>,
        task_states: TaskStateStore,
        enqueuer: Arc<MessageEnqueuer>,
        take_count: usize,
    ) -> Self {
        Self {
            store,
            task_states,
            enqueuer,
            drivers: BTreeMap::new(),
            take_count,
        }
    }

    pub fn register(&mut self, driver: Arc<dyn TableScanDriver>) -> Result<()> {
        let driver_type = driver.driver_type();
        if self.drivers.contains_key(&driver_type) {
            return Err(InsightsError::InvalidArgument(format!(
                "table scan driver {driver_type} registered twice"
            )));
        }
        self.drivers.insert(driver_type, driver);
        Ok(())
    }

    pub fn driver(&self, driver_type: TableScanDriverType) -> Result<&Arc<dyn TableScanDriver>> {
        self.drivers.get(&driver_type).ok_or_else(|| {
            InsightsError::InvalidArgument(format!(
                "no table scan driver registered for {driver_type}"
            ))
        })
    }

    pub(crate) fn task_states(&self) -> &TaskStateStore {
        &self.task_states
    }

    pub(crate) fn enqueuer(&self) -> &Arc<MessageEnqueuer> {
        &self.enqueuer
    }

    pub(crate) fn scanner(&self, segments_per_step: usize) -> TablePrefixScanner {
        TablePrefixScanner::new(Arc::clone(&self.store))
            .with_take_count(self.take_count)
            .with_segments_per_step(segments_per_step)
    }

    /// Enqueues the first steps of a scan over every entity in
    /// `source_table` whose partition key starts with `prefix`.
    pub async fn start(
        &self,
        driver_type: TableScanDriverType,
        source_table: &str,
        prefix: &str,
        start: TablePrefixScanStartParameters,
        driver_parameters: Value,
    ) -> Result<TableScan> {
        let driver = self.driver(driver_type)?;
        let scan_id = ScanId::new();
        let scan = TableScan {
            driver_type,
            scan_id,
            storage_suffix: scan_id.storage_suffix(),
            source_table: source_table.to_owned(),
            prefix: prefix.to_owned(),
        };

        driver.initialize(&driver_parameters).await?;
        self.task_states.initialize(&scan.storage_suffix).await?;

        let steps = self.scanner(start.segments_per_first_prefix).start(prefix);
        let row_keys: Vec<String> = (0..steps.len()).map(|i| i.to_string()).collect();
        self.task_states
            .add(&scan.storage_suffix, &scan.task_partition(), &row_keys)
            .await?;

        let messages: Vec<TableScanMessage> = steps
            .into_iter()
            .zip(row_keys)
            .map(|(step, task_row_key)| TableScanMessage {
                driver_type,
                scan_id,
                storage_suffix: scan.storage_suffix.clone(),
                task_row_key,
                source_table: scan.source_table.clone(),
                step,
                start,
                driver_parameters: driver_parameters.clone(),
            })
            .collect();
        self.enqueuer.enqueue_individually(&messages, Default::default()).await?;

        info!(
            driver = %driver_type,
            scan_id = %scan_id,
            table = source_table,
            prefix,
            "table scan started"
        );
        Ok(scan)
    }

    /// Steps still waiting to run.
    pub async fn pending(&self, scan: &TableScan) -> Result<usize> {
        self.task_states
            .count(&scan.storage_suffix, &scan.task_partition())
            .await
    }

    /// Returns `true` and drops the scan's task-state table once every step
    /// has run.
    pub async fn complete(&self, scan: &TableScan) -> Result<bool> {
        if self.pending(scan).await? > 0 {
            return Ok(false);
        }
        self.task_states.delete_table(&scan.storage_suffix).await?;
        info!(driver = %scan.driver_type, scan_id = %scan.scan_id, "table scan complete");
        Ok(true)
    }
}
