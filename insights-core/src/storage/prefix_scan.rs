//! Enumerates every entity whose partition key starts with a prefix without
//! knowing how the key space is laid out.
//!
//! The scan keeps an explicit stack of steps. An [`PrefixScanStep::Expand`]
//! step pages through partitions under a prefix; whenever a page ends with a
//! continuation it yields the rows it saw, a step for the rest of the
//! partition that straddles the page boundary, and a deeper expand step for
//! the next character of that partition key. Each step is self-contained, so
//! callers can also hand steps to other workers or persist them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{TableEntity, TableQuery, TableStore};
use crate::error::{InsightsError, Result};

/// Largest segment requested from the backend per query.
pub const MAX_TAKE_COUNT: usize = 1_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PrefixScanStep {
    /// Terminal result: rows already fetched.
    Segment {
        depth: usize,
        entities: Vec<TableEntity>,
    },
    /// Every row of one partition after an optional row key.
    Partition {
        depth: usize,
        partition_key: String,
        row_key_after: Option<String>,
    },
    /// Every partition under `prefix` sorting after `partition_key_after`.
    Expand {
        depth: usize,
        prefix: String,
        partition_key_after: String,
    },
}

impl PrefixScanStep {
    pub fn depth(&self) -> usize {
        match self {
            PrefixScanStep::Segment { depth, .. }
            | PrefixScanStep::Partition { depth, .. }
            | PrefixScanStep::Expand { depth, .. } => *depth,
        }
    }
}

#[derive(Clone)]
pub struct TablePrefixScanner {
    store: Arc<dyn TableStore>,
    take: usize,
    segments_per_step: Option<usize>,
}

impl std::fmt::Debug for TablePrefixScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TablePrefixScanner")
            .field("take", &self.take)
            .field("segments_per_step", &self.segments_per_step)
            .finish()
    }
}

impl TablePrefixScanner {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            take: MAX_TAKE_COUNT,
            segments_per_step: None,
        }
    }

    pub fn with_take_count(mut self, take: usize) -> Self {
        self.take = take.clamp(1, MAX_TAKE_COUNT);
        self
    }

    pub fn take_count(&self) -> usize {
        self.take
    }

    /// Caps how many backend segments a single step fetches. A step that
    /// hits the cap yields a resume step for the rest of its range, which
    /// keeps each step small enough to hand to another worker.
    pub fn with_segments_per_step(mut self, segments: usize) -> Self {
        self.segments_per_step = Some(segments.max(1));
        self
    }

    fn segment_limit_reached(&self, fetched: usize) -> bool {
        self.segments_per_step.is_some_and(|limit| fetched >= limit)
    }

    /// Collects every entity in `table` whose partition key starts with
    /// `prefix`. Output order is not guaranteed.
    pub async fn enumerate_all_by_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> Result<Vec<TableEntity>> {
        let mut output = Vec::new();
        let mut remaining: Vec<PrefixScanStep> =
            self.start(prefix).into_iter().rev().collect();

        while let Some(step) = remaining.pop() {
            trace!(
                table,
                depth = step.depth(),
                pending = remaining.len(),
                "prefix scan step"
            );
            match step {
                PrefixScanStep::Segment { entities, .. } => {
                    output.extend(entities);
                }
                other => {
                    let next = self.execute_step(table, &other).await?;
                    remaining.extend(next.into_iter().rev());
                }
            }
        }

        Ok(output)
    }

    /// Initial steps for a prefix: the partition equal to the prefix itself
    /// and every partition that extends it.
    pub fn start(&self, prefix: &str) -> Vec<PrefixScanStep> {
        vec![
            PrefixScanStep::Partition {
                depth: 0,
                partition_key: prefix.to_owned(),
                row_key_after: None,
            },
            PrefixScanStep::Expand {
                depth: 0,
                prefix: prefix.to_owned(),
                partition_key_after: prefix.to_owned(),
            },
        ]
    }

    /// Runs one step and returns the steps it produced, in the order they
    /// should be processed. Segments produce nothing.
    pub async fn execute_step(
        &self,
        table: &str,
        step: &PrefixScanStep,
    ) -> Result<Vec<PrefixScanStep>> {
        match step {
            PrefixScanStep::Segment { .. } => Ok(Vec::new()),
            PrefixScanStep::Partition {
                depth,
                partition_key,
                row_key_after,
            } => {
                self.enumerate_partition(
                    table,
                    *depth,
                    partition_key,
                    row_key_after.as_deref(),
                )
                .await
            }
            PrefixScanStep::Expand {
                depth,
                prefix,
                partition_key_after,
            } => {
                self.expand_prefix(table, *depth, prefix, partition_key_after)
                    .await
            }
        }
    }

    async fn enumerate_partition(
        &self,
        table: &str,
        depth: usize,
        partition_key: &str,
        row_key_after: Option<&str>,
    ) -> Result<Vec<PrefixScanStep>> {
        let mut query = TableQuery::partition(partition_key).with_take(self.take);
        if let Some(after) = row_key_after {
            query = query.with_row_key_after(after);
        }

        let mut output = Vec::new();
        let mut continuation = None;
        let mut fetched = 0;
        loop {
            let segment = self
                .store
                .query_segment(table, &query, continuation.as_ref())
                .await?;
            fetched += 1;
            let last_row_key = segment.entities.last().map(|e| e.row_key.clone());
            if !segment.entities.is_empty() {
                output.push(PrefixScanStep::Segment {
                    depth: depth + 1,
                    entities: segment.entities,
                });
            }
            let Some(next) = segment.continuation else {
                break;
            };
            if self.segment_limit_reached(fetched)
                && let Some(row_key_after) = last_row_key
            {
                output.push(PrefixScanStep::Partition {
                    depth: depth + 1,
                    partition_key: partition_key.to_owned(),
                    row_key_after: Some(row_key_after),
                });
                break;
            }
            continuation = Some(next);
        }

        Ok(output)
    }

    async fn expand_prefix(
        &self,
        table: &str,
        depth: usize,
        prefix: &str,
        partition_key_after: &str,
    ) -> Result<Vec<PrefixScanStep>> {
        let mut output = Vec::new();
        let upper_bound = format!("{prefix}{}", char::MAX);
        let mut last_partition_key: Option<String> = None;
        let mut fetched = 0;

        loop {
            // Once a partition key has been seen, everything sharing its next
            // character is covered by the deeper steps yielded for it.
            let lower_bound = match &last_partition_key {
                None => partition_key_after.to_owned(),
                Some(last) => {
                    format!("{}{}", increment_prefix(prefix, last)?, char::MAX)
                }
            };
            if self.segment_limit_reached(fetched) {
                output.push(PrefixScanStep::Expand {
                    depth: depth + 1,
                    prefix: prefix.to_owned(),
                    partition_key_after: lower_bound,
                });
                break;
            }
            let query = TableQuery::range(lower_bound, upper_bound.as_str())
                .with_take(self.take);

            let segment = self.store.query_segment(table, &query, None).await?;
            fetched += 1;
            let Some(last) = segment.entities.last() else {
                break;
            };
            let last_pk = last.partition_key.clone();
            let last_rk = last.row_key.clone();
            let has_more = segment.continuation.is_some();

            output.push(PrefixScanStep::Segment {
                depth: depth + 1,
                entities: segment.entities,
            });

            if has_more {
                output.push(PrefixScanStep::Partition {
                    depth: depth + 1,
                    partition_key: last_pk.clone(),
                    row_key_after: Some(last_rk),
                });
                output.push(PrefixScanStep::Expand {
                    depth: depth + 1,
                    prefix: increment_prefix(prefix, &last_pk)?,
                    partition_key_after: last_pk.clone(),
                });
            }

            last_partition_key = Some(last_pk);
            if !has_more {
                break;
            }
        }

        Ok(output)
    }
}

/// Extends `prefix` by the next full character of `partition_key`.
fn increment_prefix(prefix: &str, partition_key: &str) -> Result<String> {
    let next = partition_key
        .strip_prefix(prefix)
        .and_then(|rest| rest.chars().next())
        .ok_or_else(|| {
            InsightsError::Internal(format!(
                "partition key '{partition_key}' does not extend prefix '{prefix}'"
            ))
        })?;
    let mut out = String::with_capacity(prefix.len() + next.len_utf8());
    out.push_str(prefix);
    out.push(next);
    Ok(out)
}
