//! `BuildVersionSet`: every package version ever seen and whether it is
//! currently deleted.
//!
//! Leaves land in a per-scan staging table split into buckets by package id.
//! Each bucket is then folded into the shared version set by its own
//! aggregate message, and the staging table is dropped on finalize.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    catalog::CatalogLeafType,
    config::TableNames,
    error::Result,
    scan::{
        AggregatableDriver, CatalogIndexScan, CatalogIndexScanResult, CatalogLeafScan,
        CatalogScanDriver, CatalogScanDriverType, DriverResult, model::normalize_version,
    },
    storage::{Table, TableRow, TableStore},
};

pub const VERSION_SET_BUCKETS: u32 = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSetEntry {
    pub lower_id: String,
    pub lower_version: String,
    pub package_id: String,
    pub package_version: String,
    pub deleted: bool,
    pub commit_timestamp: DateTime<Utc>,
}

impl VersionSetEntry {
    fn from_leaf_scan(leaf: &CatalogLeafScan) -> Self {
        Self {
            lower_id: leaf.package_id.to_lowercase(),
            lower_version: normalize_version(&leaf.package_version),
            package_id: leaf.package_id.clone(),
            package_version: leaf.package_version.clone(),
            deleted: leaf.leaf_type == CatalogLeafType::PackageDelete,
            commit_timestamp: leaf.commit_timestamp,
        }
    }
}

impl TableRow for VersionSetEntry {
    fn partition_key(&self) -> String {
        self.lower_id.clone()
    }

    fn row_key(&self) -> String {
        self.lower_version.clone()
    }
}

/// Staged entry, partitioned by bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct StagedEntry {
    bucket: u32,
    entry: VersionSetEntry,
}

impl TableRow for StagedEntry {
    fn partition_key(&self) -> String {
        self.bucket.to_string()
    }

    fn row_key(&self) -> String {
        format!("{}/{}", self.entry.lower_id, self.entry.lower_version)
    }
}

/// Stable bucket for a package id (FNV-1a over the lowercase id).
pub fn bucket_for(package_id: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in package_id.to_lowercase().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % VERSION_SET_BUCKETS
}

fn newer(candidate: &VersionSetEntry, stored: &VersionSetEntry) -> bool {
    candidate.commit_timestamp > stored.commit_timestamp
}

#[derive(Clone)]
pub struct VersionSetDriver {
    store: Arc<dyn TableStore>,
    staging_base: String,
    versions: Table<VersionSetEntry>,
}

impl std::fmt::Debug for VersionSetDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSetDriver")
            .field("versions", &self.versions)
            .field("staging_base", &self.staging_base)
            .finish()
    }
}

impl VersionSetDriver {
    pub fn new(store: Arc<dyn TableStore>, tables: &TableNames) -> Self {
        Self {
            versions: Table::new(Arc::clone(&store), tables.version_set.clone()),
            staging_base: tables.version_set_staging.clone(),
            store,
        }
    }

    fn staging(&self, storage_suffix: &str) -> Table<StagedEntry> {
        Table::new(
            Arc::clone(&self.store),
            format!("{}{}", self.staging_base, storage_suffix),
        )
    }

    pub async fn did_version_ever_exist(&self, package_id: &str, version: &str) -> Result<bool> {
        Ok(self
            .versions
            .get(&package_id.to_lowercase(), &normalize_version(version))
            .await?
            .is_some())
    }

    /// Versions that exist right now.
    pub async fn get_available_versions(&self, package_id: &str) -> Result<Vec<VersionSetEntry>> {
        Ok(self
            .versions
            .query_partition(&package_id.to_lowercase())
            .await?
            .into_iter()
            .map(|stored| stored.row)
            .filter(|entry| !entry.deleted)
            .collect())
    }
}

#[async_trait]
impl CatalogScanDriver for VersionSetDriver {
    fn driver_type(&self) -> CatalogScanDriverType {
        CatalogScanDriverType::BuildVersionSet
    }

    async fn initialize(&self) -> Result<()> {
        self.versions.create_if_not_exists().await
    }

    async fn process_index(&self, scan: &CatalogIndexScan) -> Result<CatalogIndexScanResult> {
        self.staging(&scan.storage_suffix).create_if_not_exists().await?;
        Ok(CatalogIndexScanResult::ExpandAllLeaves)
    }

    async fn process_leaf(&self, leaf: &CatalogLeafScan) -> Result<DriverResult> {
        let entry = VersionSetEntry::from_leaf_scan(leaf);
        let staged = StagedEntry {
            bucket: bucket_for(&entry.lower_id),
            entry,
        };
        self.staging(&leaf.storage_suffix)
            .write_if_newer(&staged, |candidate, stored| newer(&candidate.entry, &stored.entry))
            .await?;
        Ok(DriverResult::Success)
    }

    async fn finalize(&self, scan: &CatalogIndexScan) -> Result<()> {
        self.staging(&scan.storage_suffix).delete_table().await
    }

    fn as_aggregatable(&self) -> Option<&dyn AggregatableDriver> {
        Some(self)
    }
}

#[async_trait]
impl AggregatableDriver for VersionSetDriver {
    async fn aggregate_buckets(&self, _scan: &CatalogIndexScan) -> Result<Vec<u32>> {
        Ok((0..VERSION_SET_BUCKETS).collect())
    }

    async fn aggregate(&self, scan: &CatalogIndexScan, bucket: u32) -> Result<()> {
        let staged = self
            .staging(&scan.storage_suffix)
            .query_partition(&bucket.to_string())
            .await?;
        let mut written = 0usize;
        for stored in &staged {
            if self.versions.write_if_newer(&stored.row.entry, newer).await? {
                written += 1;
            }
        }
        debug!(bucket, staged = staged.len(), written, "version set bucket merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_ignore_case_and_stay_in_range() {
        assert_eq!(bucket_for("Newtonsoft.Json"), bucket_for("newtonsoft.json"));
        for id in ["a", "b", "NuGet.Versioning", "xunit", ""] {
            assert!(bucket_for(id) < VERSION_SET_BUCKETS);
        }
    }
}
