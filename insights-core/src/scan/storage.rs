//! Persistence for index, page and leaf scans.
//!
//! Index scans live in one shared table partitioned by driver type. Page and
//! leaf scans live in tables named after the scan's storage suffix and are
//! dropped when the scan completes.

use std::sync::Arc;

use tracing::{debug, info};

use super::model::{
    CatalogIndexScan, CatalogLeafScan, CatalogPageScan, CatalogScanDriverType, ScanId,
};
use crate::{
    config::TableNames,
    error::Result,
    storage::{Table, TableQuery, TableRow, TableStore, Versioned},
};

#[derive(Clone)]
pub struct CatalogScanStorage {
    store: Arc<dyn TableStore>,
    tables: TableNames,
    index: Table<CatalogIndexScan>,
}

impl std::fmt::Debug for CatalogScanStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogScanStorage")
            .field("tables", &self.tables)
            .field("index", &self.index)
            .finish()
    }
}

impl CatalogScanStorage {
    pub fn new(store: Arc<dyn TableStore>, tables: TableNames) -> Self {
        let index = Table::new(Arc::clone(&store), tables.catalog_index_scans.clone());
        Self {
            store,
            tables,
            index,
        }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub async fn initialize(&self) -> Result<()> {
        self.index.create_if_not_exists().await
    }

    pub fn page_table_name(&self, storage_suffix: &str) -> String {
        format!("{}{}", self.tables.catalog_page_scans, storage_suffix)
    }

    pub fn leaf_table_name(&self, storage_suffix: &str) -> String {
        format!("{}{}", self.tables.catalog_leaf_scans, storage_suffix)
    }

    fn page_table(&self, storage_suffix: &str) -> Table<CatalogPageScan> {
        Table::new(Arc::clone(&self.store), self.page_table_name(storage_suffix))
    }

    fn leaf_table(&self, storage_suffix: &str) -> Table<CatalogLeafScan> {
        Table::new(Arc::clone(&self.store), self.leaf_table_name(storage_suffix))
    }

    pub async fn initialize_child_tables(&self, storage_suffix: &str) -> Result<()> {
        self.page_table(storage_suffix).create_if_not_exists().await?;
        self.leaf_table(storage_suffix).create_if_not_exists().await
    }

    pub async fn delete_child_tables(&self, storage_suffix: &str) -> Result<()> {
        self.page_table(storage_suffix).delete_table().await?;
        self.leaf_table(storage_suffix).delete_table().await
    }

    // Index scans

    pub async fn insert_index_scan(&self, scan: &CatalogIndexScan) -> Result<()> {
        self.index.insert(scan).await?;
        Ok(())
    }

    pub async fn get_index_scan(
        &self,
        driver_type: CatalogScanDriverType,
        scan_id: ScanId,
    ) -> Result<Option<Versioned<CatalogIndexScan>>> {
        self.index
            .get(driver_type.as_str(), &scan_id.to_string())
            .await
    }

    pub async fn replace_index_scan(
        &self,
        scan: &mut Versioned<CatalogIndexScan>,
    ) -> Result<()> {
        self.index.replace_versioned(scan).await
    }

    /// Newest first.
    pub async fn get_index_scans(
        &self,
        driver_type: CatalogScanDriverType,
    ) -> Result<Vec<CatalogIndexScan>> {
        let mut scans: Vec<CatalogIndexScan> = self
            .index
            .query_partition(driver_type.as_str())
            .await?
            .into_iter()
            .map(|versioned| versioned.row)
            .collect();
        scans.sort_by(|a, b| b.created.cmp(&a.created).then(b.scan_id.cmp(&a.scan_id)));
        Ok(scans)
    }

    pub async fn get_latest_index_scans(
        &self,
        driver_type: CatalogScanDriverType,
        max_entities: usize,
    ) -> Result<Vec<CatalogIndexScan>> {
        let mut scans = self.get_index_scans(driver_type).await?;
        scans.truncate(max_entities);
        Ok(scans)
    }

    /// The driver's incomplete scan, if any.
    pub async fn get_running_index_scan(
        &self,
        driver_type: CatalogScanDriverType,
    ) -> Result<Option<CatalogIndexScan>> {
        Ok(self
            .get_index_scans(driver_type)
            .await?
            .into_iter()
            .find(|scan| !scan.is_complete()))
    }

    /// Keeps the newest `keep` completed scans and removes the rest.
    pub async fn delete_old_index_scans(
        &self,
        driver_type: CatalogScanDriverType,
        keep: usize,
    ) -> Result<usize> {
        let completed: Vec<CatalogIndexScan> = self
            .get_index_scans(driver_type)
            .await?
            .into_iter()
            .filter(CatalogIndexScan::is_complete)
            .collect();

        let mut deleted = 0;
        for scan in completed.iter().skip(keep) {
            if self
                .index
                .delete(driver_type.as_str(), &scan.scan_id.to_string(), None)
                .await?
            {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(driver = %driver_type, deleted, keep, "deleted old index scans");
        }
        Ok(deleted)
    }

    // Page scans

    pub async fn insert_page_scans(&self, pages: &[CatalogPageScan]) -> Result<usize> {
        let mut inserted = 0;
        for page in pages {
            if self.page_table(&page.storage_suffix).insert_if_absent(page).await? {
                inserted += 1;
            }
        }
        debug!(requested = pages.len(), inserted, "page scans inserted");
        Ok(inserted)
    }

    pub async fn get_page_scan(
        &self,
        storage_suffix: &str,
        scan_id: ScanId,
        page_id: &str,
    ) -> Result<Option<Versioned<CatalogPageScan>>> {
        self.page_table(storage_suffix)
            .get(&scan_id.to_string(), page_id)
            .await
    }

    pub async fn get_page_scans(
        &self,
        storage_suffix: &str,
        scan_id: ScanId,
    ) -> Result<Vec<CatalogPageScan>> {
        Ok(self
            .page_table(storage_suffix)
            .query_partition(&scan_id.to_string())
            .await?
            .into_iter()
            .map(|versioned| versioned.row)
            .collect())
    }

    pub async fn replace_page_scan(
        &self,
        page: &mut Versioned<CatalogPageScan>,
    ) -> Result<()> {
        self.page_table(&page.row.storage_suffix)
            .replace_versioned(page)
            .await
    }

    pub async fn delete_page_scan(&self, page: &CatalogPageScan) -> Result<bool> {
        self.page_table(&page.storage_suffix)
            .delete(&page.scan_id.to_string(), &page.page_id, None)
            .await
    }

    pub async fn any_page_scans(&self, storage_suffix: &str, scan_id: ScanId) -> Result<bool> {
        self.page_table(storage_suffix)
            .any(TableQuery::partition(scan_id.to_string()))
            .await
    }

    // Leaf scans

    /// Inserts leaves, skipping rows a previous delivery already wrote.
    pub async fn insert_leaf_scans(&self, leaves: &[CatalogLeafScan]) -> Result<usize> {
        let mut inserted = 0;
        for leaf in leaves {
            if self.leaf_table(&leaf.storage_suffix).insert_if_absent(leaf).await? {
                inserted += 1;
            }
        }
        debug!(requested = leaves.len(), inserted, "leaf scans inserted");
        Ok(inserted)
    }

    /// Writes a leaf keyed by package identity unless a row with the same or
    /// a newer commit is already there. Returns whether the row changed.
    pub async fn write_latest_leaf_scan(&self, leaf: &CatalogLeafScan) -> Result<bool> {
        self.leaf_table(&leaf.storage_suffix)
            .write_if_newer(leaf, |candidate, stored| {
                candidate.commit_timestamp > stored.commit_timestamp
            })
            .await
    }

    pub async fn get_leaf_scan(
        &self,
        storage_suffix: &str,
        partition_key: &str,
        leaf_id: &str,
    ) -> Result<Option<Versioned<CatalogLeafScan>>> {
        self.leaf_table(storage_suffix)
            .get(partition_key, leaf_id)
            .await
    }

    pub async fn get_leaf_scans(
        &self,
        storage_suffix: &str,
        partition_key: &str,
    ) -> Result<Vec<CatalogLeafScan>> {
        Ok(self
            .leaf_table(storage_suffix)
            .query_partition(partition_key)
            .await?
            .into_iter()
            .map(|versioned| versioned.row)
            .collect())
    }

    pub async fn replace_leaf_scan(
        &self,
        leaf: &mut Versioned<CatalogLeafScan>,
    ) -> Result<()> {
        self.leaf_table(&leaf.row.storage_suffix)
            .replace_versioned(leaf)
            .await
    }

    pub async fn delete_leaf_scan(&self, leaf: &CatalogLeafScan) -> Result<bool> {
        self.leaf_table(&leaf.storage_suffix)
            .delete(&leaf.partition_key(), &leaf.leaf_id, None)
            .await
    }

    pub async fn any_leaf_scans(&self, storage_suffix: &str) -> Result<bool> {
        self.leaf_table(storage_suffix).any(TableQuery::all()).await
    }
}
