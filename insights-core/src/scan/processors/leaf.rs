//! Runs driver logic for leaf scans.
//!
//! A leaf scan row is deleted once its driver succeeds, so a missing row
//! means the work is already done. Failures bump the row's attempt count
//! and hand the message back to the dispatcher for an individual retry.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    dispatcher::{BatchMessageProcessor, BatchOutcome},
    error::Result,
    scan::{
        context::CatalogScanContext,
        driver::{DriverResult, RegisteredDriver},
        messages::CatalogLeafScanMessage,
        model::{CatalogLeafScan, CatalogScanDriverType},
    },
    storage::{TableRow, Versioned},
};

type LeafKey = (String, String);

fn leaf_key(leaf: &CatalogLeafScan) -> LeafKey {
    (leaf.partition_key(), leaf.leaf_id.clone())
}

#[derive(Clone, Debug)]
pub struct CatalogLeafScanProcessor {
    context: CatalogScanContext,
}

impl CatalogLeafScanProcessor {
    pub fn new(context: CatalogScanContext) -> Self {
        Self { context }
    }

    async fn run_driver(
        &self,
        registered: &RegisteredDriver,
        leaves: Vec<CatalogLeafScan>,
    ) -> BatchOutcome<CatalogLeafScan> {
        if let Some(batch) = registered.driver.as_batch() {
            let copies = leaves.clone();
            return match batch.process_leaves(leaves).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        driver = %registered.driver.driver_type(),
                        count = copies.len(),
                        "batch leaf processing failed: {err}"
                    );
                    BatchOutcome {
                        failed: copies,
                        ..BatchOutcome::default()
                    }
                }
            };
        }

        let mut outcome = BatchOutcome::success();
        for leaf in leaves {
            match registered.driver.process_leaf(&leaf).await {
                Ok(DriverResult::Success) => {}
                Ok(DriverResult::TryAgainLater(delay)) => outcome.retry_after(delay, leaf),
                Err(err) => {
                    warn!(
                        driver = %leaf.driver_type,
                        package_id = %leaf.package_id,
                        package_version = %leaf.package_version,
                        attempt_count = leaf.attempt_count,
                        "leaf processing failed: {err}"
                    );
                    outcome.fail(leaf);
                }
            }
        }
        outcome
    }

    async fn record_attempt(
        &self,
        stored: &mut Versioned<CatalogLeafScan>,
        retry_after: Option<Duration>,
    ) {
        stored.row.attempt_count += 1;
        stored.row.next_attempt = retry_after
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| Utc::now() + delay);
        if let Err(err) = self.context.storage.replace_leaf_scan(stored).await {
            // The retry still happens; only the bookkeeping is lost.
            warn!(leaf_id = %stored.row.leaf_id, "failed to record leaf attempt: {err}");
        }
    }
}

#[async_trait]
impl BatchMessageProcessor<CatalogLeafScanMessage> for CatalogLeafScanProcessor {
    async fn process_batch(
        &self,
        messages: Vec<CatalogLeafScanMessage>,
        _delivery_count: u32,
    ) -> Result<BatchOutcome<CatalogLeafScanMessage>> {
        let mut by_key: HashMap<LeafKey, (CatalogLeafScanMessage, Versioned<CatalogLeafScan>)> =
            HashMap::new();
        let mut by_driver: HashMap<CatalogScanDriverType, Vec<CatalogLeafScan>> = HashMap::new();

        for message in messages {
            let stored = self
                .context
                .storage
                .get_leaf_scan(&message.storage_suffix, &message.partition_key, &message.leaf_id)
                .await?;
            let Some(stored) = stored else {
                debug!(leaf_id = %message.leaf_id, "leaf scan already complete");
                continue;
            };
            by_driver
                .entry(stored.row.driver_type)
                .or_default()
                .push(stored.row.clone());
            by_key.insert(leaf_key(&stored.row), (message, stored));
        }

        let mut outcome = BatchOutcome::success();
        for (driver_type, leaves) in by_driver {
            let registered = self.context.drivers.get(driver_type)?;
            let result = self.run_driver(registered, leaves.clone()).await;

            for leaf in &result.failed {
                if let Some((message, mut stored)) = by_key.remove(&leaf_key(leaf)) {
                    self.record_attempt(&mut stored, None).await;
                    outcome.fail(message);
                }
            }
            for (delay, retry) in &result.try_again_later {
                for leaf in retry {
                    if let Some((message, mut stored)) = by_key.remove(&leaf_key(leaf)) {
                        self.record_attempt(&mut stored, Some(*delay)).await;
                        outcome.retry_after(*delay, message);
                    }
                }
            }

            for leaf in &leaves {
                if by_key.remove(&leaf_key(leaf)).is_some() {
                    self.context.storage.delete_leaf_scan(leaf).await?;
                }
            }
        }

        Ok(outcome)
    }
}
