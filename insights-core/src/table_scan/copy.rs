use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{TableScanDriver, TableScanDriverType};
use crate::{
    error::Result,
    storage::{TableEntity, TableStore},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableCopyParameters {
    pub destination_table_name: String,
}

impl TableCopyParameters {
    fn parse(parameters: &Value) -> Result<Self> {
        Ok(serde_json::from_value(parameters.clone())?)
    }
}

/// Copies every visited row into another table, keeping its keys.
pub struct TableCopyDriver {
    store: Arc<dyn TableStore>,
}

impl fmt::Debug for TableCopyDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCopyDriver").finish_non_exhaustive()
    }
}

impl TableCopyDriver {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TableScanDriver for TableCopyDriver {
    fn driver_type(&self) -> TableScanDriverType {
        TableScanDriverType::TableCopy
    }

    async fn initialize(&self, parameters: &Value) -> Result<()> {
        let parameters = TableCopyParameters::parse(parameters)?;
        self.store
            .create_table_if_not_exists(&parameters.destination_table_name)
            .await
    }

    async fn process_entities(
        &self,
        parameters: &Value,
        entities: Vec<TableEntity>,
    ) -> Result<()> {
        let parameters = TableCopyParameters::parse(parameters)?;
        let count = entities.len();
        for entity in entities {
            self.store
                .upsert(
                    &parameters.destination_table_name,
                    &entity.partition_key,
                    &entity.row_key,
                    entity.value,
                )
                .await?;
        }
        debug!(
            table = %parameters.destination_table_name,
            rows = count,
            "copied rows"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{error::InsightsError, storage::InMemoryTableStore};

    #[tokio::test]
    async fn copies_rows_with_their_keys() {
        let store: Arc<dyn TableStore> = Arc::new(InMemoryTableStore::new());
        store.create_table_if_not_exists("source").await.unwrap();
        let source = store
            .upsert("source", "p", "r", json!({"id": 7}))
            .await
            .unwrap();

        let driver = TableCopyDriver::new(Arc::clone(&store));
        let parameters = json!({"destination_table_name": "dest"});
        driver.initialize(&parameters).await.unwrap();
        driver
            .process_entities(&parameters, vec![source])
            .await
            .unwrap();

        let copied = store.get("dest", "p", "r").await.unwrap().unwrap();
        assert_eq!(copied.value, json!({"id": 7}));
    }

    #[tokio::test]
    async fn missing_destination_is_not_retried() {
        let driver = TableCopyDriver::new(Arc::new(InMemoryTableStore::new()));
        let err = driver.initialize(&json!({})).await.unwrap_err();
        assert!(matches!(err, InsightsError::Serialization(_)));
        assert!(!err.is_transient());
    }
}
