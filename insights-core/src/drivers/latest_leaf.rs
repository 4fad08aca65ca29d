//! Keeps the newest catalog leaf for every package version.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    catalog::{CatalogLeafItem, CatalogLeafType},
    dispatcher::BatchOutcome,
    error::Result,
    scan::{
        BatchLeafDriver, CatalogIndexScan, CatalogIndexScanResult, CatalogLeafScan,
        CatalogScanDriver, CatalogScanDriverType, DriverResult, ReprocessableDriver,
        model::normalize_version,
    },
    storage::{Table, TableQuery, TableRow, TableStore},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestPackageLeaf {
    pub lower_id: String,
    pub lower_version: String,
    pub package_id: String,
    pub package_version: String,
    pub leaf_type: CatalogLeafType,
    pub commit_timestamp: DateTime<Utc>,
    pub commit_id: String,
    pub url: String,
    #[serde(default)]
    pub page_url: String,
}

impl LatestPackageLeaf {
    pub fn from_leaf_scan(leaf: &CatalogLeafScan) -> Self {
        Self {
            lower_id: leaf.package_id.to_lowercase(),
            lower_version: normalize_version(&leaf.package_version),
            package_id: leaf.package_id.clone(),
            package_version: leaf.package_version.clone(),
            leaf_type: leaf.leaf_type,
            commit_timestamp: leaf.commit_timestamp,
            commit_id: leaf.commit_id.clone(),
            url: leaf.url.clone(),
            page_url: leaf.page_url.clone(),
        }
    }

    pub fn to_leaf_item(&self) -> CatalogLeafItem {
        CatalogLeafItem {
            url: self.url.clone(),
            leaf_type: self.leaf_type,
            commit_timestamp: self.commit_timestamp,
            commit_id: self.commit_id.clone(),
            package_id: self.package_id.clone(),
            package_version: self.package_version.clone(),
        }
    }
}

impl TableRow for LatestPackageLeaf {
    fn partition_key(&self) -> String {
        self.lower_id.clone()
    }

    fn row_key(&self) -> String {
        self.lower_version.clone()
    }
}

/// `LoadLatestPackageLeaf`: a table of the newest leaf per package version.
#[derive(Clone, Debug)]
pub struct LatestLeafDriver {
    table: Table<LatestPackageLeaf>,
}

impl LatestLeafDriver {
    pub fn new(store: Arc<dyn TableStore>, table_name: impl Into<String>) -> Self {
        Self {
            table: Table::new(store, table_name),
        }
    }

    pub async fn get(
        &self,
        package_id: &str,
        package_version: &str,
    ) -> Result<Option<LatestPackageLeaf>> {
        Ok(self
            .table
            .get(&package_id.to_lowercase(), &normalize_version(package_version))
            .await?
            .map(|stored| stored.row))
    }

    pub async fn get_versions(&self, package_id: &str) -> Result<Vec<LatestPackageLeaf>> {
        Ok(self
            .table
            .query_partition(&package_id.to_lowercase())
            .await?
            .into_iter()
            .map(|stored| stored.row)
            .collect())
    }

    async fn write(&self, leaf: &CatalogLeafScan) -> Result<bool> {
        self.table
            .write_if_newer(&LatestPackageLeaf::from_leaf_scan(leaf), |candidate, stored| {
                candidate.commit_timestamp > stored.commit_timestamp
            })
            .await
    }
}

#[async_trait]
impl CatalogScanDriver for LatestLeafDriver {
    fn driver_type(&self) -> CatalogScanDriverType {
        CatalogScanDriverType::LoadLatestPackageLeaf
    }

    async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await
    }

    async fn process_index(&self, _scan: &CatalogIndexScan) -> Result<CatalogIndexScanResult> {
        Ok(CatalogIndexScanResult::ExpandLatestLeaves)
    }

    async fn process_leaf(&self, leaf: &CatalogLeafScan) -> Result<DriverResult> {
        self.write(leaf).await?;
        Ok(DriverResult::Success)
    }

    fn as_batch(&self) -> Option<&dyn BatchLeafDriver> {
        Some(self)
    }

    fn as_reprocessable(&self) -> Option<&dyn ReprocessableDriver> {
        Some(self)
    }
}

#[async_trait]
impl BatchLeafDriver for LatestLeafDriver {
    async fn process_leaves(
        &self,
        leaves: Vec<CatalogLeafScan>,
    ) -> Result<BatchOutcome<CatalogLeafScan>> {
        let mut outcome = BatchOutcome::success();
        for leaf in leaves {
            if let Err(err) = self.write(&leaf).await {
                warn!(package_id = %leaf.package_id, "latest leaf write failed: {err}");
                outcome.fail(leaf);
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ReprocessableDriver for LatestLeafDriver {
    /// Replays every stored leaf.
    async fn leaves_to_reprocess(&self) -> Result<Vec<CatalogLeafItem>> {
        Ok(self
            .table
            .query(&TableQuery::all())
            .await?
            .into_iter()
            .map(|stored| stored.row.to_leaf_item())
            .collect())
    }
}
