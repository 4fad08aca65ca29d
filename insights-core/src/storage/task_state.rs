use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ETag, Table, TableQuery, TableRow, TableStore, Versioned};
use crate::error::{InsightsError, Result};

/// Identifies one pending unit of work in a task-state table.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskStateKey {
    pub storage_suffix: String,
    pub partition_key: String,
    pub row_key: String,
}

impl TaskStateKey {
    pub fn new(
        storage_suffix: impl Into<String>,
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Self {
        Self {
            storage_suffix: storage_suffix.into(),
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

/// Pending-work marker. Its presence means the task has not finished; it is
/// deleted by whoever completes the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub storage_suffix: String,
    pub partition_key: String,
    pub row_key: String,
    #[serde(default)]
    pub parameters: Option<String>,
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl TaskState {
    pub fn new(key: TaskStateKey) -> Self {
        Self {
            storage_suffix: key.storage_suffix,
            partition_key: key.partition_key,
            row_key: key.row_key,
            parameters: None,
            etag: None,
        }
    }

    pub fn key(&self) -> TaskStateKey {
        TaskStateKey::new(
            self.storage_suffix.clone(),
            self.partition_key.clone(),
            self.row_key.clone(),
        )
    }

    fn from_versioned(versioned: Versioned<TaskState>) -> Self {
        Self {
            etag: Some(versioned.etag),
            ..versioned.row
        }
    }
}

impl TableRow for TaskState {
    fn partition_key(&self) -> String {
        self.partition_key.clone()
    }

    fn row_key(&self) -> String {
        self.row_key.clone()
    }
}

/// Task-state tables, one per storage suffix.
#[derive(Clone)]
pub struct TaskStateStore {
    store: Arc<dyn TableStore>,
    base_table: String,
}

impl std::fmt::Debug for TaskStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateStore")
            .field("base_table", &self.base_table)
            .finish()
    }
}

impl TaskStateStore {
    pub fn new(store: Arc<dyn TableStore>, base_table: impl Into<String>) -> Self {
        Self {
            store,
            base_table: base_table.into(),
        }
    }

    fn table(&self, storage_suffix: &str) -> Table<TaskState> {
        Table::new(
            Arc::clone(&self.store),
            format!("{}{}", self.base_table, storage_suffix),
        )
    }

    pub async fn initialize(&self, storage_suffix: &str) -> Result<()> {
        self.table(storage_suffix).create_if_not_exists().await
    }

    pub async fn delete_table(&self, storage_suffix: &str) -> Result<()> {
        self.table(storage_suffix).delete_table().await
    }

    /// Adds one marker per row key. Markers that already exist are left
    /// untouched.
    pub async fn add(
        &self,
        storage_suffix: &str,
        partition_key: &str,
        row_keys: &[String],
    ) -> Result<usize> {
        let states: Vec<TaskState> = row_keys
            .iter()
            .map(|row_key| {
                TaskState::new(TaskStateKey::new(
                    storage_suffix,
                    partition_key,
                    row_key.clone(),
                ))
            })
            .collect();
        self.add_many(&states).await
    }

    pub async fn add_many(&self, states: &[TaskState]) -> Result<usize> {
        let mut added = 0;
        for state in states {
            if self.table(&state.storage_suffix).insert_if_absent(state).await? {
                added += 1;
            }
        }
        debug!(requested = states.len(), added, "task states added");
        Ok(added)
    }

    pub async fn get(&self, key: &TaskStateKey) -> Result<Option<TaskState>> {
        Ok(self
            .table(&key.storage_suffix)
            .get(&key.partition_key, &key.row_key)
            .await?
            .map(TaskState::from_versioned))
    }

    pub async fn get_by_row_key_prefix(
        &self,
        storage_suffix: &str,
        partition_key: &str,
        row_key_prefix: &str,
    ) -> Result<Vec<TaskState>> {
        let query =
            TableQuery::partition(partition_key).with_row_key_prefix(row_key_prefix);
        Ok(self
            .table(storage_suffix)
            .query(&query)
            .await?
            .into_iter()
            .map(TaskState::from_versioned)
            .collect())
    }

    pub async fn get_all(
        &self,
        storage_suffix: &str,
        partition_key: &str,
    ) -> Result<Vec<TaskState>> {
        self.get_by_row_key_prefix(storage_suffix, partition_key, "")
            .await
    }

    pub async fn count(
        &self,
        storage_suffix: &str,
        partition_key: &str,
    ) -> Result<usize> {
        Ok(self.get_all(storage_suffix, partition_key).await?.len())
    }

    /// Persists `state` under its current etag and refreshes the etag.
    pub async fn update(&self, state: &mut TaskState) -> Result<()> {
        let etag = state.etag.clone().ok_or_else(|| {
            InsightsError::InvalidArgument(
                "task state must be read before it is updated".into(),
            )
        })?;
        let new_etag = self
            .table(&state.storage_suffix)
            .replace(state, &etag)
            .await?;
        state.etag = Some(new_etag);
        Ok(())
    }

    /// Removes a marker. Returns whether it still existed.
    pub async fn delete(&self, state: &TaskState) -> Result<bool> {
        self.table(&state.storage_suffix)
            .delete(&state.partition_key, &state.row_key, state.etag.as_deref())
            .await
    }

    pub async fn delete_key(&self, key: &TaskStateKey) -> Result<bool> {
        self.table(&key.storage_suffix)
            .delete(&key.partition_key, &key.row_key, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTableStore;

    async fn store() -> TaskStateStore {
        let store = TaskStateStore::new(
            Arc::new(InMemoryTableStore::new()),
            "taskstate",
        );
        store.initialize("s1").await.expect("initialize");
        store
    }

    #[tokio::test]
    async fn adds_many_and_ignores_existing() {
        let store = store().await;
        let row_keys: Vec<String> = (0..150).map(|i| format!("{i:04}")).collect();

        let added = store.add("s1", "pk", &row_keys).await.expect("add");
        assert_eq!(added, 150);

        let mut existing = store
            .get(&TaskStateKey::new("s1", "pk", "0001"))
            .await
            .expect("get")
            .expect("present");
        existing.parameters = Some("kept".into());
        store.update(&mut existing).await.expect("update");

        let added = store
            .add("s1", "pk", &["0001".to_string(), "9999".to_string()])
            .await
            .expect("add again");
        assert_eq!(added, 1);

        let reread = store
            .get(&TaskStateKey::new("s1", "pk", "0001"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(reread.parameters.as_deref(), Some("kept"));
        assert_eq!(store.count("s1", "pk").await.expect("count"), 151);
    }

    #[tokio::test]
    async fn get_returns_none_when_missing() {
        let store = store().await;
        assert!(
            store
                .get(&TaskStateKey::new("s1", "pk", "nope"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn update_fails_when_etag_changed_or_deleted() {
        let store = store().await;
        store
            .add("s1", "pk", &["a".to_string()])
            .await
            .expect("add");
        let key = TaskStateKey::new("s1", "pk", "a");

        let mut first = store.get(&key).await.expect("get").expect("present");
        let mut second = store.get(&key).await.expect("get").expect("present");

        first.parameters = Some("one".into());
        store.update(&mut first).await.expect("first update");

        second.parameters = Some("two".into());
        let err = store
            .update(&mut second)
            .await
            .expect_err("stale etag must fail");
        assert!(err.is_precondition_failed());

        assert!(store.delete(&first).await.expect("delete"));
        first.parameters = Some("three".into());
        let err = store
            .update(&mut first)
            .await
            .expect_err("deleted state must fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn filters_by_row_key_prefix() {
        let store = store().await;
        let row_keys: Vec<String> = ["a-1", "a-2", "b-1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        store.add("s1", "pk", &row_keys).await.expect("add");

        let a = store
            .get_by_row_key_prefix("s1", "pk", "a-")
            .await
            .expect("prefix a");
        assert_eq!(a.len(), 2);

        let all = store
            .get_by_row_key_prefix("s1", "pk", "")
            .await
            .expect("empty prefix");
        assert_eq!(all.len(), 3);
    }
}
