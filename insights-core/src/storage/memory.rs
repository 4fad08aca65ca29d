use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Continuation, QuerySegment, TableEntity, TableQuery, TableStore};
use crate::error::{InsightsError, Result};

type Key = (String, String);
type Rows = BTreeMap<Key, TableEntity>;

/// Process-local [`TableStore`] used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: RwLock<HashMap<String, Rows>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.tables.read().await.contains_key(table)
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn entity(partition_key: &str, row_key: &str, value: Value) -> TableEntity {
        TableEntity {
            partition_key: partition_key.to_owned(),
            row_key: row_key.to_owned(),
            etag: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            value,
        }
    }

    fn missing_table(table: &str) -> InsightsError {
        InsightsError::NotFound(format!("table '{table}' does not exist"))
    }

    fn describe(table: &str, partition_key: &str, row_key: &str) -> String {
        format!("{table}({partition_key}, {row_key})")
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(table.to_owned())
            .or_default();
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.tables.write().await.remove(table);
        Ok(())
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| {
            rows.get(&(partition_key.to_owned(), row_key.to_owned()))
                .cloned()
        }))
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity> {
        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        let key = (partition_key.to_owned(), row_key.to_owned());
        if rows.contains_key(&key) {
            return Err(InsightsError::Conflict(Self::describe(
                table,
                partition_key,
                row_key,
            )));
        }
        let entity = Self::entity(partition_key, row_key, value);
        rows.insert(key, entity.clone());
        Ok(entity)
    }

    async fn upsert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity> {
        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        let entity = Self::entity(partition_key, row_key, value);
        rows.insert(
            (partition_key.to_owned(), row_key.to_owned()),
            entity.clone(),
        );
        Ok(entity)
    }

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
        etag: &str,
    ) -> Result<TableEntity> {
        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        let key = (partition_key.to_owned(), row_key.to_owned());
        let Some(existing) = rows.get(&key) else {
            return Err(InsightsError::NotFound(Self::describe(
                table,
                partition_key,
                row_key,
            )));
        };
        if existing.etag != etag {
            return Err(InsightsError::PreconditionFailed(Self::describe(
                table,
                partition_key,
                row_key,
            )));
        }
        let entity = Self::entity(partition_key, row_key, value);
        rows.insert(key, entity.clone());
        Ok(entity)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(false);
        };
        let key = (partition_key.to_owned(), row_key.to_owned());
        let current = rows.get(&key).map(|existing| existing.etag.clone());
        match (current, etag) {
            (None, _) => Ok(false),
            (Some(current), Some(etag)) if current != etag => {
                Err(InsightsError::PreconditionFailed(Self::describe(
                    table,
                    partition_key,
                    row_key,
                )))
            }
            (Some(_), _) => {
                rows.remove(&key);
                Ok(true)
            }
        }
    }

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QuerySegment> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table) else {
            return Ok(QuerySegment::default());
        };

        let lower = match continuation {
            Some(token) => Bound::Excluded((
                token.partition_key.clone(),
                token.row_key.clone(),
            )),
            None => Bound::Unbounded,
        };

        let take = query.take.max(1);
        let mut matching = rows
            .range((lower, Bound::Unbounded))
            .map(|(_, entity)| entity)
            .filter(|entity| {
                query.matches(&entity.partition_key, &entity.row_key)
            });

        let entities: Vec<TableEntity> =
            matching.by_ref().take(take).cloned().collect();
        let has_more = matching.next().is_some();

        let continuation = match (has_more, entities.last()) {
            (true, Some(last)) => Some(Continuation {
                partition_key: last.partition_key.clone(),
                row_key: last.row_key.clone(),
            }),
            _ => None,
        };

        Ok(QuerySegment {
            entities,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store_with(table: &str) -> InMemoryTableStore {
        let store = InMemoryTableStore::new();
        store
            .create_table_if_not_exists(table)
            .await
            .expect("create table");
        store
    }

    #[tokio::test]
    async fn insert_conflicts_on_existing_key() {
        let store = store_with("t").await;
        store
            .insert("t", "pk", "rk", json!({ "a": 1 }))
            .await
            .expect("first insert");

        let err = store
            .insert("t", "pk", "rk", json!({ "a": 2 }))
            .await
            .expect_err("second insert must conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn replace_requires_current_etag() {
        let store = store_with("t").await;
        let first = store
            .insert("t", "pk", "rk", json!(1))
            .await
            .expect("insert");
        let second = store
            .replace("t", "pk", "rk", json!(2), &first.etag)
            .await
            .expect("replace with current etag");

        let err = store
            .replace("t", "pk", "rk", json!(3), &first.etag)
            .await
            .expect_err("stale etag");
        assert!(err.is_precondition_failed());

        assert!(
            store
                .delete("t", "pk", "rk", Some(&second.etag))
                .await
                .expect("delete")
        );
        let err = store
            .replace("t", "pk", "rk", json!(4), &second.etag)
            .await
            .expect_err("deleted entity");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn writes_to_missing_table_fail_and_reads_are_empty() {
        let store = InMemoryTableStore::new();
        assert!(
            store
                .insert("missing", "pk", "rk", json!(1))
                .await
                .expect_err("missing table")
                .is_not_found()
        );
        assert!(
            store
                .get("missing", "pk", "rk")
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn segments_are_ordered_and_resumable() {
        let store = store_with("t").await;
        for pk in ["b", "a", "c"] {
            for rk in ["2", "1"] {
                store
                    .insert("t", pk, rk, json!(null))
                    .await
                    .expect("insert");
            }
        }

        let query = TableQuery::range("a", "c").with_take(1);
        let first = store
            .query_segment("t", &query, None)
            .await
            .expect("first segment");
        assert_eq!(first.entities[0].partition_key, "b");
        assert_eq!(first.entities[0].row_key, "1");
        let token = first.continuation.expect("more rows in b");

        let second = store
            .query_segment("t", &query, Some(&token))
            .await
            .expect("second segment");
        assert_eq!(second.entities[0].row_key, "2");
        assert!(second.continuation.is_none());
    }
}
