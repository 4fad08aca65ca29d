//! Partitioned key-value storage.
//!
//! Every durable component (cursors, leases, scan records, task state,
//! timers) is written against [`TableStore`]: named tables of entities keyed
//! by `(partition_key, row_key)`, ordered by ordinal string comparison, with
//! optimistic concurrency through opaque etags.

use std::{any::type_name, fmt, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{InsightsError, Result};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod prefix_scan;
pub mod task_state;

pub use memory::InMemoryTableStore;
pub use prefix_scan::{PrefixScanStep, TablePrefixScanner};
pub use task_state::{TaskState, TaskStateKey, TaskStateStore};

pub type ETag = String;

/// A stored entity as seen by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub etag: ETag,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

/// Which partitions a query touches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionFilter {
    All,
    Exact(String),
    /// Partition keys strictly between the two bounds.
    Range {
        lower_exclusive: String,
        upper_exclusive: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableQuery {
    pub partition: PartitionFilter,
    /// Only rows whose row key sorts after this value.
    pub row_key_after: Option<String>,
    /// Only rows whose row key starts with this value.
    pub row_key_prefix: Option<String>,
    /// Maximum entities per segment.
    pub take: usize,
}

impl TableQuery {
    pub const DEFAULT_TAKE: usize = 1_000;

    pub fn all() -> Self {
        Self {
            partition: PartitionFilter::All,
            row_key_after: None,
            row_key_prefix: None,
            take: Self::DEFAULT_TAKE,
        }
    }

    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition: PartitionFilter::Exact(partition_key.into()),
            ..Self::all()
        }
    }

    pub fn range(
        lower_exclusive: impl Into<String>,
        upper_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            partition: PartitionFilter::Range {
                lower_exclusive: lower_exclusive.into(),
                upper_exclusive: upper_exclusive.into(),
            },
            ..Self::all()
        }
    }

    pub fn with_row_key_after(mut self, row_key: impl Into<String>) -> Self {
        self.row_key_after = Some(row_key.into());
        self
    }

    pub fn with_row_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.row_key_prefix = Some(prefix.into());
        self
    }

    pub fn with_take(mut self, take: usize) -> Self {
        self.take = take.max(1);
        self
    }

    /// Whether an entity key satisfies this query's filters.
    pub fn matches(&self, partition_key: &str, row_key: &str) -> bool {
        let partition_ok = match &self.partition {
            PartitionFilter::All => true,
            PartitionFilter::Exact(expected) => partition_key == expected,
            PartitionFilter::Range {
                lower_exclusive,
                upper_exclusive,
            } => {
                partition_key > lower_exclusive.as_str()
                    && partition_key < upper_exclusive.as_str()
            }
        };
        if !partition_ok {
            return false;
        }
        if let Some(after) = &self.row_key_after
            && row_key <= after.as_str()
        {
            return false;
        }
        if let Some(prefix) = &self.row_key_prefix
            && !row_key.starts_with(prefix.as_str())
        {
            return false;
        }
        true
    }
}

/// Resume point for a segmented query: the key of the last entity returned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub partition_key: String,
    pub row_key: String,
}

#[derive(Clone, Debug, Default)]
pub struct QuerySegment {
    pub entities: Vec<TableEntity>,
    /// Present when more matching entities may follow.
    pub continuation: Option<Continuation>,
}

/// Backend contract for partitioned tables.
///
/// Writes to a table that does not exist fail with `NotFound`; reads from a
/// missing table behave as if it were empty.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()>;

    async fn delete_table(&self, table: &str) -> Result<()>;

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>>;

    /// Fails with `Conflict` when the key already exists.
    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity>;

    async fn upsert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity>;

    /// Fails with `PreconditionFailed` when the etag is stale and `NotFound`
    /// when the entity is gone.
    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
        etag: &str,
    ) -> Result<TableEntity>;

    /// Returns whether an entity was removed. A stale etag fails with
    /// `PreconditionFailed`.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool>;

    /// Returns one page of matches ordered by `(partition_key, row_key)`,
    /// starting strictly after `continuation`.
    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QuerySegment>;

    /// Drains every segment of a query. Backends with a cheaper bulk path
    /// should override this.
    async fn query_all(
        &self,
        table: &str,
        query: &TableQuery,
    ) -> Result<Vec<TableEntity>> {
        let mut output = Vec::new();
        let mut continuation: Option<Continuation> = None;
        loop {
            let segment = self
                .query_segment(table, query, continuation.as_ref())
                .await?;
            output.extend(segment.entities);
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(output)
    }
}

/// Serializable record stored in a [`Table`].
pub trait TableRow: Serialize + DeserializeOwned + Send + Sync {
    fn partition_key(&self) -> String;
    fn row_key(&self) -> String;
}

/// A decoded row plus the concurrency token it was read with.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub row: T,
    pub etag: ETag,
    pub timestamp: DateTime<Utc>,
}

impl<T: DeserializeOwned> Versioned<T> {
    pub fn decode(entity: TableEntity) -> Result<Self> {
        Ok(Self {
            row: serde_json::from_value(entity.value)?,
            etag: entity.etag,
            timestamp: entity.timestamp,
        })
    }
}

/// Typed view over one table of a [`TableStore`].
pub struct Table<T> {
    store: Arc<dyn TableStore>,
    name: String,
    _row: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            _row: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("row_type", &type_name::<T>())
            .finish()
    }
}

impl<T: TableRow> Table<T> {
    pub fn new(store: Arc<dyn TableStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            _row: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub async fn create_if_not_exists(&self) -> Result<()> {
        self.store.create_table_if_not_exists(&self.name).await
    }

    pub async fn delete_table(&self) -> Result<()> {
        self.store.delete_table(&self.name).await
    }

    pub async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Versioned<T>>> {
        self.store
            .get(&self.name, partition_key, row_key)
            .await?
            .map(Versioned::decode)
            .transpose()
    }

    pub async fn insert(&self, row: &T) -> Result<ETag> {
        let entity = self
            .store
            .insert(
                &self.name,
                &row.partition_key(),
                &row.row_key(),
                serde_json::to_value(row)?,
            )
            .await?;
        Ok(entity.etag)
    }

    /// Inserts, treating an existing entity with the same key as success.
    pub async fn insert_if_absent(&self, row: &T) -> Result<bool> {
        match self.insert(row).await {
            Ok(_) => Ok(true),
            Err(InsightsError::Conflict(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn upsert(&self, row: &T) -> Result<ETag> {
        let entity = self
            .store
            .upsert(
                &self.name,
                &row.partition_key(),
                &row.row_key(),
                serde_json::to_value(row)?,
            )
            .await?;
        Ok(entity.etag)
    }

    pub async fn replace(&self, row: &T, etag: &str) -> Result<ETag> {
        let entity = self
            .store
            .replace(
                &self.name,
                &row.partition_key(),
                &row.row_key(),
                serde_json::to_value(row)?,
                etag,
            )
            .await?;
        Ok(entity.etag)
    }

    /// Writes `row` unless the stored row with the same key is at least as
    /// new according to `is_newer(candidate, stored)`. Lost races are retried
    /// against the winner. Returns whether `row` was written.
    pub async fn write_if_newer<F>(&self, row: &T, is_newer: F) -> Result<bool>
    where
        F: Fn(&T, &T) -> bool + Send + Sync,
    {
        let partition_key = row.partition_key();
        let row_key = row.row_key();
        loop {
            match self.get(&partition_key, &row_key).await? {
                None => match self.insert(row).await {
                    Ok(_) => return Ok(true),
                    Err(InsightsError::Conflict(_)) => continue,
                    Err(err) => return Err(err),
                },
                Some(stored) if !is_newer(row, &stored.row) => return Ok(false),
                Some(stored) => match self.replace(row, &stored.etag).await {
                    Ok(_) => return Ok(true),
                    Err(InsightsError::PreconditionFailed(_) | InsightsError::NotFound(_)) => {
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }

    /// Writes `versioned.row` back under its etag and refreshes the etag.
    pub async fn replace_versioned(
        &self,
        versioned: &mut Versioned<T>,
    ) -> Result<()> {
        versioned.etag = self.replace(&versioned.row, &versioned.etag).await?;
        Ok(())
    }

    pub async fn delete(
        &self,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        self.store
            .delete(&self.name, partition_key, row_key, etag)
            .await
    }

    pub async fn query(&self, query: &TableQuery) -> Result<Vec<Versioned<T>>> {
        self.store
            .query_all(&self.name, query)
            .await?
            .into_iter()
            .map(Versioned::decode)
            .collect()
    }

    pub async fn query_partition(
        &self,
        partition_key: &str,
    ) -> Result<Vec<Versioned<T>>> {
        self.query(&TableQuery::partition(partition_key)).await
    }

    /// Cheap existence probe: fetches at most one entity.
    pub async fn any(&self, query: TableQuery) -> Result<bool> {
        let segment = self
            .store
            .query_segment(&self.name, &query.with_take(1), None)
            .await?;
        Ok(!segment.entities.is_empty())
    }
}
