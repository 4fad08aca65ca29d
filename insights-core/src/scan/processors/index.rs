//! The index scan state machine.
//!
//! Each delivery of a [`CatalogIndexScanMessage`] advances the scan as far as
//! it can. When the scan has to wait on page scans, leaf scans or aggregate
//! buckets, the message re-enqueues itself with a delay that grows with
//! every poll that made no progress.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::MessageProcessor,
    error::{InsightsError, Result},
    scan::{
        context::CatalogScanContext,
        driver::RegisteredDriver,
        messages::{
            AggregateBucketMessage, CatalogIndexScanMessage, CatalogLeafScanMessage,
            CatalogPageScanMessage,
        },
        model::{
            CatalogIndexScan, CatalogIndexScanResult, CatalogIndexScanState, CatalogLeafScan,
            CatalogPageScan, CatalogPageScanMode, CatalogPageScanState, CatalogScanKind,
        },
    },
    storage::{PrefixScanStep, TableRow, Versioned},
};

enum Progress {
    /// State advanced; keep going in this delivery.
    Continue,
    /// Children are still running.
    Wait,
    Done,
}

#[derive(Clone, Debug)]
pub struct CatalogIndexScanProcessor {
    context: CatalogScanContext,
}

impl CatalogIndexScanProcessor {
    pub fn new(context: CatalogScanContext) -> Self {
        Self { context }
    }

    async fn save(&self, scan: &mut Versioned<CatalogIndexScan>) -> Result<()> {
        self.context.storage.replace_index_scan(scan).await
    }

    async fn transition(
        &self,
        scan: &mut Versioned<CatalogIndexScan>,
        next: CatalogIndexScanState,
    ) -> Result<Progress> {
        debug!(
            scan_id = %scan.row.scan_id,
            from = ?scan.row.state,
            to = ?next,
            "index scan state change"
        );
        scan.row.state = next;
        self.save(scan).await?;
        Ok(Progress::Continue)
    }

    async fn advance(
        &self,
        registered: &RegisteredDriver,
        scan: &mut Versioned<CatalogIndexScan>,
    ) -> Result<Progress> {
        match scan.row.state {
            CatalogIndexScanState::Created => self.on_created(registered, scan).await,
            CatalogIndexScanState::Expanding => self.on_expanding(registered, scan).await,
            CatalogIndexScanState::WaitingForPages => {
                if self
                    .context
                    .storage
                    .any_page_scans(&scan.row.storage_suffix, scan.row.scan_id)
                    .await?
                {
                    return Ok(Progress::Wait);
                }
                let next = match scan.row.result {
                    Some(CatalogIndexScanResult::Expand) => CatalogIndexScanState::Working,
                    _ => CatalogIndexScanState::Enqueuing,
                };
                self.transition(scan, next).await
            }
            CatalogIndexScanState::Enqueuing => {
                self.enqueue_leaves(&scan.row).await?;
                self.transition(scan, CatalogIndexScanState::Working).await
            }
            CatalogIndexScanState::Working => {
                if self
                    .context
                    .storage
                    .any_leaf_scans(&scan.row.storage_suffix)
                    .await?
                {
                    return Ok(Progress::Wait);
                }
                let next = if registered.capabilities.aggregatable {
                    CatalogIndexScanState::StartingAggregate
                } else {
                    CatalogIndexScanState::Finalizing
                };
                self.transition(scan, next).await
            }
            CatalogIndexScanState::StartingAggregate => {
                self.start_aggregate(registered, &scan.row).await?;
                self.transition(scan, CatalogIndexScanState::Aggregating).await
            }
            CatalogIndexScanState::Aggregating => {
                let pending = self
                    .context
                    .task_states
                    .count(&scan.row.storage_suffix, &scan.row.scan_id.to_string())
                    .await?;
                if pending > 0 {
                    debug!(scan_id = %scan.row.scan_id, pending, "aggregation in progress");
                    return Ok(Progress::Wait);
                }
                self.transition(scan, CatalogIndexScanState::Finalizing).await
            }
            CatalogIndexScanState::Finalizing => {
                self.finalize(registered, scan).await?;
                Ok(Progress::Done)
            }
            CatalogIndexScanState::Complete => Ok(Progress::Done),
        }
    }

    async fn on_created(
        &self,
        registered: &RegisteredDriver,
        scan: &mut Versioned<CatalogIndexScan>,
    ) -> Result<Progress> {
        scan.row.started.get_or_insert_with(Utc::now);
        self.context
            .storage
            .initialize_child_tables(&scan.row.storage_suffix)
            .await?;

        if scan.row.kind == CatalogScanKind::Reprocess {
            self.write_reprocess_leaves(registered, &scan.row).await?;
            scan.row.result = Some(CatalogIndexScanResult::ExpandLatestLeaves);
            return self.transition(scan, CatalogIndexScanState::Enqueuing).await;
        }

        let result = registered.driver.process_index(&scan.row).await?;
        if result == CatalogIndexScanResult::CustomExpand {
            let custom = registered.driver.as_custom_expandable().ok_or_else(|| {
                InsightsError::InvalidArgument(format!(
                    "{} asked for a custom expansion without supporting it",
                    scan.row.driver_type
                ))
            })?;
            custom.start_custom_expand(&scan.row).await?;
        }
        scan.row.result = Some(result);
        self.transition(scan, CatalogIndexScanState::Expanding).await
    }

    async fn on_expanding(
        &self,
        registered: &RegisteredDriver,
        scan: &mut Versioned<CatalogIndexScan>,
    ) -> Result<Progress> {
        let mode = match scan.row.result {
            Some(CatalogIndexScanResult::CustomExpand) => {
                let complete = match registered.driver.as_custom_expandable() {
                    Some(custom) => custom.is_custom_expand_complete(&scan.row).await?,
                    None => true,
                };
                if !complete {
                    return Ok(Progress::Wait);
                }
                return self.transition(scan, CatalogIndexScanState::Working).await;
            }
            Some(CatalogIndexScanResult::ExpandAllLeaves) => CatalogPageScanMode::WriteAllLeaves,
            Some(CatalogIndexScanResult::ExpandLatestLeaves) => {
                CatalogPageScanMode::WriteLatestLeaves
            }
            Some(CatalogIndexScanResult::Expand) | None => CatalogPageScanMode::Expand,
        };

        let index = self.context.catalog.get_index().await?;
        let pages: Vec<CatalogPageScan> = index
            .pages_in_bounds(scan.row.min, scan.row.max)
            .into_iter()
            .enumerate()
            .map(|(rank, page)| CatalogPageScan {
                scan_id: scan.row.scan_id,
                page_id: CatalogPageScan::page_id_for_rank(rank),
                storage_suffix: scan.row.storage_suffix.clone(),
                driver_type: scan.row.driver_type,
                mode,
                state: CatalogPageScanState::Created,
                url: page.url,
                min: scan.row.min,
                max: scan.row.max,
                rank,
                parameters: scan.row.parameters.clone(),
            })
            .collect();

        self.context.storage.insert_page_scans(&pages).await?;
        let messages: Vec<CatalogPageScanMessage> = pages
            .iter()
            .map(|page| CatalogPageScanMessage {
                storage_suffix: page.storage_suffix.clone(),
                scan_id: page.scan_id,
                page_id: page.page_id.clone(),
            })
            .collect();
        self.context.enqueuer.enqueue(&messages).await?;
        info!(
            scan_id = %scan.row.scan_id,
            pages = pages.len(),
            mode = ?mode,
            "index scan expanded into page scans"
        );

        self.transition(scan, CatalogIndexScanState::WaitingForPages).await
    }

    async fn write_reprocess_leaves(
        &self,
        registered: &RegisteredDriver,
        scan: &CatalogIndexScan,
    ) -> Result<()> {
        let reprocessable = registered.driver.as_reprocessable().ok_or_else(|| {
            InsightsError::InvalidArgument(format!(
                "{} does not support reprocessing",
                scan.driver_type
            ))
        })?;
        let leaves = reprocessable.leaves_to_reprocess().await?;

        // Reprocessed leaves have no source page; a synthetic one carries the
        // scan-level fields onto each leaf.
        let page = CatalogPageScan {
            scan_id: scan.scan_id,
            page_id: CatalogPageScan::page_id_for_rank(0),
            storage_suffix: scan.storage_suffix.clone(),
            driver_type: scan.driver_type,
            mode: CatalogPageScanMode::WriteLatestLeaves,
            state: CatalogPageScanState::Created,
            url: String::new(),
            min: scan.min,
            max: scan.max,
            rank: 0,
            parameters: scan.parameters.clone(),
        };
        for leaf in &leaves {
            self.context
                .storage
                .write_latest_leaf_scan(&CatalogLeafScan::for_latest_leaf(&page, leaf))
                .await?;
        }
        info!(scan_id = %scan.scan_id, leaves = leaves.len(), "reprocess leaves written");
        Ok(())
    }

    async fn enqueue_leaves(&self, scan: &CatalogIndexScan) -> Result<()> {
        let scanner = self.context.prefix_scanner();
        let table = self.context.storage.leaf_table_name(&scan.storage_suffix);
        let prefix = scan.leaf_partition_prefix();

        // Steps are executed one at a time so each segment is enqueued as soon
        // as it is read.
        let mut pending: Vec<PrefixScanStep> = scanner.start(&prefix).into_iter().rev().collect();
        let mut enqueued = 0usize;
        while let Some(step) = pending.pop() {
            match step {
                PrefixScanStep::Segment { entities, .. } => {
                    let messages = entities
                        .into_iter()
                        .map(|entity| {
                            let leaf = Versioned::<CatalogLeafScan>::decode(entity)?.row;
                            Ok(CatalogLeafScanMessage {
                                storage_suffix: leaf.storage_suffix.clone(),
                                partition_key: leaf.partition_key(),
                                package_id: leaf.package_id.to_lowercase(),
                                leaf_id: leaf.leaf_id,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    enqueued += messages.len();
                    self.context.enqueuer.enqueue(&messages).await?;
                }
                other => {
                    let next = scanner.execute_step(&table, &other).await?;
                    pending.extend(next.into_iter().rev());
                }
            }
        }
        info!(scan_id = %scan.scan_id, leaves = enqueued, "leaf scans enqueued");
        Ok(())
    }

    async fn start_aggregate(
        &self,
        registered: &RegisteredDriver,
        scan: &CatalogIndexScan,
    ) -> Result<()> {
        let aggregatable = registered.driver.as_aggregatable().ok_or_else(|| {
            InsightsError::Internal(format!("{} lost its aggregate capability", scan.driver_type))
        })?;
        let buckets = aggregatable.aggregate_buckets(scan).await?;

        let partition_key = scan.scan_id.to_string();
        let row_keys: Vec<String> = buckets.iter().map(u32::to_string).collect();
        self.context.task_states.initialize(&scan.storage_suffix).await?;
        self.context
            .task_states
            .add(&scan.storage_suffix, &partition_key, &row_keys)
            .await?;

        let messages: Vec<AggregateBucketMessage> = buckets
            .into_iter()
            .map(|bucket| AggregateBucketMessage {
                driver_type: scan.driver_type,
                scan_id: scan.scan_id,
                storage_suffix: scan.storage_suffix.clone(),
                bucket,
            })
            .collect();
        self.context.enqueuer.enqueue(&messages).await?;
        info!(scan_id = %scan.scan_id, buckets = messages.len(), "aggregation started");
        Ok(())
    }

    async fn finalize(
        &self,
        registered: &RegisteredDriver,
        scan: &mut Versioned<CatalogIndexScan>,
    ) -> Result<()> {
        registered.driver.finalize(&scan.row).await?;

        if scan.row.kind == CatalogScanKind::Update {
            self.context
                .cursors
                .set(&scan.row.cursor_name, scan.row.max)
                .await?;
        }

        self.context
            .storage
            .delete_child_tables(&scan.row.storage_suffix)
            .await?;
        if registered.capabilities.aggregatable {
            self.context
                .task_states
                .delete_table(&scan.row.storage_suffix)
                .await?;
        }

        scan.row.state = CatalogIndexScanState::Complete;
        scan.row.completed = Some(Utc::now());
        self.save(scan).await?;
        info!(
            driver = %scan.row.driver_type,
            scan_id = %scan.row.scan_id,
            max = %scan.row.max,
            "catalog scan complete"
        );

        self.context
            .storage
            .delete_old_index_scans(
                scan.row.driver_type,
                self.context.config.old_index_scans_to_keep,
            )
            .await?;
        Ok(())
    }

    async fn poll_later(
        &self,
        message: &CatalogIndexScanMessage,
        attempt_count: u32,
    ) -> Result<()> {
        let delay = self.context.poll_delay(attempt_count);
        debug!(
            scan_id = %message.scan_id,
            attempt_count,
            delay_secs = delay.as_secs(),
            "index scan waiting"
        );
        self.context
            .enqueuer
            .enqueue_with_delay(
                &[CatalogIndexScanMessage {
                    attempt_count,
                    ..message.clone()
                }],
                delay,
            )
            .await
    }
}

#[async_trait]
impl MessageProcessor<CatalogIndexScanMessage> for CatalogIndexScanProcessor {
    async fn process(&self, message: &CatalogIndexScanMessage, _delivery_count: u32) -> Result<()> {
        let Some(mut scan) = self
            .context
            .storage
            .get_index_scan(message.driver_type, message.scan_id)
            .await?
        else {
            warn!(scan_id = %message.scan_id, "index scan no longer exists");
            return Ok(());
        };
        let registered = self.context.drivers.get(scan.row.driver_type)?.clone();

        let initial_state = scan.row.state;
        loop {
            match self.advance(&registered, &mut scan).await? {
                Progress::Continue => continue,
                Progress::Done => return Ok(()),
                Progress::Wait => {
                    let attempt_count = if scan.row.state == initial_state {
                        message.attempt_count + 1
                    } else {
                        1
                    };
                    return self.poll_later(message, attempt_count).await;
                }
            }
        }
    }
}
