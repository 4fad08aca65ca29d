//! Starts catalog scans and reports on them.
//!
//! `update` decides the `(min, max]` window for a driver from its own cursor
//! and the cursors it depends on, and only creates a scan when the window is
//! non-empty. The scan itself is then driven by queue messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::{
    context::CatalogScanContext,
    messages::CatalogIndexScanMessage,
    model::{
        CatalogIndexScan, CatalogScanDriverType, CatalogScanKind, ScanDependency,
    },
};
use crate::{
    cursor::CURSOR_MIN,
    error::{InsightsError, Result},
};

/// Outcome of asking for a scan to start.
#[derive(Clone, Debug, PartialEq)]
pub enum CatalogScanUpdate {
    NewStarted(Box<CatalogIndexScan>),
    AlreadyRunning(Box<CatalogIndexScan>),
    Disabled,
    BlockedByDependency {
        dependency: ScanDependency,
    },
    MinAfterMax {
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    },
    FullyCaughtUpWithDependency {
        dependency: ScanDependency,
    },
    FullyCaughtUpWithMax,
}

impl CatalogScanUpdate {
    pub fn scan(&self) -> Option<&CatalogIndexScan> {
        match self {
            CatalogScanUpdate::NewStarted(scan) | CatalogScanUpdate::AlreadyRunning(scan) => {
                Some(scan)
            }
            _ => None,
        }
    }

    pub fn is_new_started(&self) -> bool {
        matches!(self, CatalogScanUpdate::NewStarted(_))
    }
}

/// Cursor plus recent scans for one driver.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogScanState {
    pub driver_type: CatalogScanDriverType,
    pub cursor_name: String,
    pub cursor_value: DateTime<Utc>,
    pub is_enabled: bool,
    pub is_registered: bool,
    pub latest_scans: Vec<CatalogIndexScan>,
}

impl CatalogScanState {
    pub fn is_running(&self) -> bool {
        self.latest_scans.iter().any(|scan| !scan.is_complete())
    }
}

#[derive(Clone, Debug)]
pub struct CatalogScanService {
    context: CatalogScanContext,
}

impl CatalogScanService {
    /// Scans shown per driver by [`CatalogScanService::get_state`].
    pub const LATEST_SCANS_SHOWN: usize = 5;

    pub fn new(context: CatalogScanContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &CatalogScanContext {
        &self.context
    }

    pub async fn initialize(&self) -> Result<()> {
        self.context.storage.initialize().await?;
        self.context.cursors.initialize().await?;
        for registered in self.context.drivers.iter() {
            registered.driver.initialize().await?;
        }
        Ok(())
    }

    /// Cursor value with never-written cursors mapped to the driver minimum.
    pub async fn get_min(&self, driver_type: CatalogScanDriverType) -> Result<DateTime<Utc>> {
        let value = self.context.cursors.get(&driver_type.cursor_name()).await?;
        Ok(if value == CURSOR_MIN {
            driver_type.default_min()
        } else {
            value
        })
    }

    /// The most restrictive dependency and its cursor value.
    pub async fn get_dependency_max(
        &self,
        driver_type: CatalogScanDriverType,
    ) -> Result<(ScanDependency, DateTime<Utc>)> {
        let mut lowest: Option<(ScanDependency, DateTime<Utc>)> = None;
        for dependency in driver_type.dependencies() {
            let value = match dependency {
                ScanDependency::FlatContainer => {
                    self.context.remote_cursors.get_flat_container_cursor().await?
                }
                ScanDependency::Driver(other) => {
                    self.context.cursors.get(&other.cursor_name()).await?
                }
            };
            if lowest.is_none_or(|(_, current)| value < current) {
                lowest = Some((dependency, value));
            }
        }
        lowest.ok_or_else(|| {
            InsightsError::Internal(format!("{driver_type} declares no dependencies"))
        })
    }

    #[instrument(skip(self), fields(driver = %driver_type))]
    pub async fn update(
        &self,
        driver_type: CatalogScanDriverType,
        max: Option<DateTime<Utc>>,
    ) -> Result<CatalogScanUpdate> {
        self.context.drivers.get(driver_type)?;

        if self.context.config.is_disabled(driver_type) {
            debug!("driver disabled");
            return Ok(CatalogScanUpdate::Disabled);
        }

        if let Some(running) = self
            .context
            .storage
            .get_running_index_scan(driver_type)
            .await?
        {
            return Ok(CatalogScanUpdate::AlreadyRunning(Box::new(running)));
        }

        let (dependency, dependency_max) = self.get_dependency_max(driver_type).await?;
        if dependency_max == CURSOR_MIN {
            return Ok(CatalogScanUpdate::BlockedByDependency { dependency });
        }
        if let Some(custom) = max
            && custom > dependency_max
        {
            return Ok(CatalogScanUpdate::BlockedByDependency { dependency });
        }

        let resolved_max = max.unwrap_or(dependency_max);
        let min = self.get_min(driver_type).await?;

        if min > resolved_max {
            return Ok(CatalogScanUpdate::MinAfterMax {
                min,
                max: resolved_max,
            });
        }
        if min == resolved_max {
            return Ok(match max {
                Some(_) => CatalogScanUpdate::FullyCaughtUpWithMax,
                None => CatalogScanUpdate::FullyCaughtUpWithDependency { dependency },
            });
        }

        let scan = CatalogIndexScan::new(driver_type, CatalogScanKind::Update, min, resolved_max);
        self.start(scan).await
    }

    /// Runs [`CatalogScanService::update`] for every registered driver. A
    /// driver that fails is recorded and logged; the rest still get updated.
    pub async fn update_all(
        &self,
        max: Option<DateTime<Utc>>,
    ) -> BTreeMap<CatalogScanDriverType, Result<CatalogScanUpdate>> {
        let mut results = BTreeMap::new();
        for driver_type in self.context.drivers.types() {
            let result = self.update(driver_type, max).await;
            if let Err(err) = &result {
                warn!(driver = %driver_type, "catalog scan update failed: {err}");
            }
            results.insert(driver_type, result);
        }
        results
    }

    /// Starts a scan over the leaves the driver wants processed again. The
    /// cursor is neither consulted nor moved.
    #[instrument(skip(self), fields(driver = %driver_type))]
    pub async fn reprocess(&self, driver_type: CatalogScanDriverType) -> Result<CatalogScanUpdate> {
        let registered = self.context.drivers.get(driver_type)?;
        if !registered.capabilities.reprocessable {
            return Err(InsightsError::InvalidArgument(format!(
                "{driver_type} does not support reprocessing"
            )));
        }

        if self.context.config.is_disabled(driver_type) {
            return Ok(CatalogScanUpdate::Disabled);
        }
        if let Some(running) = self
            .context
            .storage
            .get_running_index_scan(driver_type)
            .await?
        {
            return Ok(CatalogScanUpdate::AlreadyRunning(Box::new(running)));
        }

        let cursor = self.get_min(driver_type).await?;
        let scan = CatalogIndexScan::new(driver_type, CatalogScanKind::Reprocess, cursor, cursor);
        self.start(scan).await
    }

    async fn start(&self, scan: CatalogIndexScan) -> Result<CatalogScanUpdate> {
        self.context.storage.insert_index_scan(&scan).await?;
        self.context
            .enqueuer
            .enqueue(&[CatalogIndexScanMessage {
                driver_type: scan.driver_type,
                scan_id: scan.scan_id,
                attempt_count: 0,
            }])
            .await?;
        info!(
            driver = %scan.driver_type,
            scan_id = %scan.scan_id,
            kind = ?scan.kind,
            min = %scan.min,
            max = %scan.max,
            "catalog scan started"
        );
        Ok(CatalogScanUpdate::NewStarted(Box::new(scan)))
    }

    pub async fn is_running(&self, driver_type: CatalogScanDriverType) -> Result<bool> {
        Ok(self
            .context
            .storage
            .get_running_index_scan(driver_type)
            .await?
            .is_some())
    }

    pub async fn get_state(&self, driver_type: CatalogScanDriverType) -> Result<CatalogScanState> {
        let cursor_name = driver_type.cursor_name();
        let cursor_value = self.context.cursors.get(&cursor_name).await?;
        let latest_scans = self
            .context
            .storage
            .get_latest_index_scans(driver_type, Self::LATEST_SCANS_SHOWN)
            .await?;
        Ok(CatalogScanState {
            driver_type,
            cursor_name,
            cursor_value,
            is_enabled: !self.context.config.is_disabled(driver_type),
            is_registered: self.context.drivers.contains(driver_type),
            latest_scans,
        })
    }

    /// State of every known driver type, registered or not.
    pub async fn get_all_states(&self) -> Result<Vec<CatalogScanState>> {
        let mut states = Vec::with_capacity(CatalogScanDriverType::ALL.len());
        for driver_type in CatalogScanDriverType::ALL {
            states.push(self.get_state(driver_type).await?);
        }
        Ok(states)
    }
}
