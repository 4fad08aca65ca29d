use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    catalog::CatalogLeafItem,
    dispatcher::MessageProcessor,
    error::Result,
    scan::{
        context::CatalogScanContext,
        messages::{CatalogLeafScanMessage, CatalogPageScanMessage},
        model::{
            CatalogLeafScan, CatalogPageScan, CatalogPageScanMode, CatalogPageScanResult,
            CatalogPageScanState, normalize_version,
        },
    },
    storage::{TableRow, Versioned},
};

/// Expands one catalog page into leaf scans.
#[derive(Clone, Debug)]
pub struct CatalogPageScanProcessor {
    context: CatalogScanContext,
}

impl CatalogPageScanProcessor {
    pub fn new(context: CatalogScanContext) -> Self {
        Self { context }
    }

    async fn fetch_leaves(&self, page: &CatalogPageScan) -> Result<Vec<CatalogLeafItem>> {
        let document = self.context.catalog.get_page(&page.url).await?;
        Ok(document.leaves_in_bounds(page.min, page.max))
    }

    async fn expand(&self, mut page: Versioned<CatalogPageScan>) -> Result<()> {
        if page.row.state == CatalogPageScanState::Created {
            let driver = self.context.drivers.driver(page.row.driver_type)?;
            let result = driver.process_page(&page.row).await?;

            let mut leaves = self.fetch_leaves(&page.row).await?;
            if result == CatalogPageScanResult::ExpandRemoveDuplicates {
                leaves = latest_per_identity(leaves);
            }
            let leaf_scans: Vec<CatalogLeafScan> = leaves
                .iter()
                .enumerate()
                .map(|(index, leaf)| CatalogLeafScan::for_page_leaf(&page.row, index, leaf))
                .collect();
            self.context.storage.insert_leaf_scans(&leaf_scans).await?;

            page.row.state = CatalogPageScanState::Enqueuing;
            self.context.storage.replace_page_scan(&mut page).await?;
        }

        let leaf_scans = self
            .context
            .storage
            .get_leaf_scans(&page.row.storage_suffix, &page.row.leaf_partition_key())
            .await?;
        let messages: Vec<CatalogLeafScanMessage> = leaf_scans
            .iter()
            .map(|leaf| CatalogLeafScanMessage {
                storage_suffix: leaf.storage_suffix.clone(),
                partition_key: leaf.partition_key(),
                leaf_id: leaf.leaf_id.clone(),
                package_id: leaf.package_id.to_lowercase(),
            })
            .collect();
        self.context.enqueuer.enqueue(&messages).await?;
        debug!(
            scan_id = %page.row.scan_id,
            page_id = %page.row.page_id,
            leaves = messages.len(),
            "page expanded"
        );
        Ok(())
    }

    async fn write_all(&self, page: &CatalogPageScan) -> Result<()> {
        let leaves = self.fetch_leaves(page).await?;
        let leaf_scans: Vec<CatalogLeafScan> = leaves
            .iter()
            .enumerate()
            .map(|(index, leaf)| CatalogLeafScan::for_page_leaf(page, index, leaf))
            .collect();
        self.context.storage.insert_leaf_scans(&leaf_scans).await?;
        Ok(())
    }

    async fn write_latest(&self, page: &CatalogPageScan) -> Result<()> {
        let leaves = latest_per_identity(self.fetch_leaves(page).await?);
        let mut written = 0usize;
        for leaf in &leaves {
            if self
                .context
                .storage
                .write_latest_leaf_scan(&CatalogLeafScan::for_latest_leaf(page, leaf))
                .await?
            {
                written += 1;
            }
        }
        debug!(
            scan_id = %page.scan_id,
            page_id = %page.page_id,
            leaves = leaves.len(),
            written,
            "latest leaves written"
        );
        Ok(())
    }
}

/// Keeps the newest commit for each package identity, preserving commit
/// order among the survivors.
fn latest_per_identity(leaves: Vec<CatalogLeafItem>) -> Vec<CatalogLeafItem> {
    let mut newest: HashMap<(String, String), usize> = HashMap::new();
    for (index, leaf) in leaves.iter().enumerate() {
        let identity = (
            leaf.package_id.to_lowercase(),
            normalize_version(&leaf.package_version),
        );
        match newest.get(&identity) {
            Some(&existing) if leaves[existing].commit_timestamp > leaf.commit_timestamp => {}
            _ => {
                newest.insert(identity, index);
            }
        }
    }

    let mut keep: Vec<usize> = newest.into_values().collect();
    keep.sort_unstable();
    keep.into_iter().map(|index| leaves[index].clone()).collect()
}

#[async_trait]
impl MessageProcessor<CatalogPageScanMessage> for CatalogPageScanProcessor {
    async fn process(&self, message: &CatalogPageScanMessage, _delivery_count: u32) -> Result<()> {
        let Some(page) = self
            .context
            .storage
            .get_page_scan(&message.storage_suffix, message.scan_id, &message.page_id)
            .await?
        else {
            warn!(
                scan_id = %message.scan_id,
                page_id = %message.page_id,
                "page scan no longer exists"
            );
            return Ok(());
        };

        let row = page.row.clone();
        match row.mode {
            CatalogPageScanMode::Expand => self.expand(page).await?,
            CatalogPageScanMode::WriteAllLeaves => self.write_all(&row).await?,
            CatalogPageScanMode::WriteLatestLeaves => self.write_latest(&row).await?,
        }

        self.context.storage.delete_page_scan(&row).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::catalog::CatalogLeafType;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, sec)
            .single()
            .expect("valid timestamp")
    }

    fn leaf(id: &str, version: &str, sec: u32) -> CatalogLeafItem {
        CatalogLeafItem {
            url: format!("https://example/{id}.{version}.{sec}.json"),
            leaf_type: CatalogLeafType::PackageDetails,
            commit_timestamp: at(sec),
            commit_id: format!("c{sec}"),
            package_id: id.into(),
            package_version: version.into(),
        }
    }

    #[test]
    fn duplicates_collapse_to_newest_commit() {
        let leaves = vec![
            leaf("Foo", "1.0.0", 1),
            leaf("Bar", "2.0.0", 2),
            leaf("foo", "1.0.0+meta", 3),
            leaf("Foo", "1.1.0", 4),
        ];

        let kept: Vec<(String, u32)> = latest_per_identity(leaves)
            .into_iter()
            .map(|l| (l.package_id, l.commit_id.trim_start_matches('c').parse().unwrap_or(0)))
            .collect();
        assert_eq!(
            kept,
            vec![
                ("Bar".to_string(), 2),
                ("foo".to_string(), 3),
                ("Foo".to_string(), 4),
            ]
        );
    }
}
