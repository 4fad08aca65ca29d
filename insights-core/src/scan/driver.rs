//! Driver contract and optional capabilities.
//!
//! A driver supplies the per-scan business logic; the scan state machine owns
//! everything else. Capabilities are probed once, when the driver is
//! registered.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::model::{
    CatalogIndexScan, CatalogIndexScanResult, CatalogLeafScan, CatalogPageScan,
    CatalogPageScanResult, CatalogScanDriverType,
};
use crate::{
    catalog::CatalogLeafItem,
    dispatcher::BatchOutcome,
    error::{InsightsError, Result},
};

/// Outcome of processing one leaf. Failures are reported as errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverResult {
    Success,
    TryAgainLater(Duration),
}

#[async_trait]
pub trait CatalogScanDriver: Send + Sync {
    fn driver_type(&self) -> CatalogScanDriverType;

    /// Creates whatever storage the driver writes to. Idempotent.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Picks the expansion mode and prepares scan-scoped storage.
    async fn process_index(&self, scan: &CatalogIndexScan) -> Result<CatalogIndexScanResult>;

    async fn process_page(&self, _scan: &CatalogPageScan) -> Result<CatalogPageScanResult> {
        Ok(CatalogPageScanResult::Expand)
    }

    async fn process_leaf(&self, leaf: &CatalogLeafScan) -> Result<DriverResult>;

    /// Runs once every leaf and aggregate is done, before the cursor moves.
    async fn finalize(&self, _scan: &CatalogIndexScan) -> Result<()> {
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchLeafDriver> {
        None
    }

    fn as_aggregatable(&self) -> Option<&dyn AggregatableDriver> {
        None
    }

    fn as_custom_expandable(&self) -> Option<&dyn CustomExpandableDriver> {
        None
    }

    fn as_reprocessable(&self) -> Option<&dyn ReprocessableDriver> {
        None
    }
}

/// Processes many leaves in one call.
#[async_trait]
pub trait BatchLeafDriver: Send + Sync {
    async fn process_leaves(
        &self,
        leaves: Vec<CatalogLeafScan>,
    ) -> Result<BatchOutcome<CatalogLeafScan>>;
}

/// Adds an aggregation phase after all leaves are processed. Each bucket is
/// tracked by a task state and aggregated by its own message.
#[async_trait]
pub trait AggregatableDriver: Send + Sync {
    async fn aggregate_buckets(&self, scan: &CatalogIndexScan) -> Result<Vec<u32>>;

    async fn aggregate(&self, scan: &CatalogIndexScan, bucket: u32) -> Result<()>;
}

/// Drivers that expand a scan themselves instead of walking catalog pages.
#[async_trait]
pub trait CustomExpandableDriver: Send + Sync {
    async fn start_custom_expand(&self, scan: &CatalogIndexScan) -> Result<()>;

    async fn is_custom_expand_complete(&self, scan: &CatalogIndexScan) -> Result<bool>;
}

/// Drivers that can name leaves worth processing again.
#[async_trait]
pub trait ReprocessableDriver: Send + Sync {
    async fn leaves_to_reprocess(&self) -> Result<Vec<CatalogLeafItem>>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DriverCapabilities {
    pub batch: bool,
    pub aggregatable: bool,
    pub custom_expandable: bool,
    pub reprocessable: bool,
}

impl DriverCapabilities {
    fn probe(driver: &dyn CatalogScanDriver) -> Self {
        Self {
            batch: driver.as_batch().is_some(),
            aggregatable: driver.as_aggregatable().is_some(),
            custom_expandable: driver.as_custom_expandable().is_some(),
            reprocessable: driver.as_reprocessable().is_some(),
        }
    }
}

#[derive(Clone)]
pub struct RegisteredDriver {
    pub driver: Arc<dyn CatalogScanDriver>,
    pub capabilities: DriverCapabilities,
}

impl fmt::Debug for RegisteredDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredDriver")
            .field("driver_type", &self.driver.driver_type())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Drivers keyed by type.
#[derive(Clone, Debug, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<CatalogScanDriverType, RegisteredDriver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn CatalogScanDriver>) -> Result<()> {
        let driver_type = driver.driver_type();
        if self.drivers.contains_key(&driver_type) {
            return Err(InsightsError::InvalidArgument(format!(
                "driver {driver_type} registered twice"
            )));
        }
        let capabilities = DriverCapabilities::probe(driver.as_ref());
        self.drivers.insert(
            driver_type,
            RegisteredDriver {
                driver,
                capabilities,
            },
        );
        Ok(())
    }

    pub fn with(mut self, driver: Arc<dyn CatalogScanDriver>) -> Result<Self> {
        self.register(driver)?;
        Ok(self)
    }

    pub fn get(&self, driver_type: CatalogScanDriverType) -> Result<&RegisteredDriver> {
        self.drivers.get(&driver_type).ok_or_else(|| {
            InsightsError::InvalidArgument(format!("no driver registered for {driver_type}"))
        })
    }

    pub fn driver(
        &self,
        driver_type: CatalogScanDriverType,
    ) -> Result<&Arc<dyn CatalogScanDriver>> {
        Ok(&self.get(driver_type)?.driver)
    }

    pub fn contains(&self, driver_type: CatalogScanDriverType) -> bool {
        self.drivers.contains_key(&driver_type)
    }

    /// Registered types in declaration order.
    pub fn types(&self) -> Vec<CatalogScanDriverType> {
        self.drivers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredDriver> {
        self.drivers.values()
    }
}
