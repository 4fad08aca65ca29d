use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::Result,
    storage::{Table, TableRow, TableStore},
};

/// Value reported for cursors that have never been written.
pub const CURSOR_MIN: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

const CURSOR_PARTITION: &str = "";

/// A named watermark: everything at or before `value` is fully processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub name: String,
    pub value: DateTime<Utc>,
}

impl TableRow for CursorRecord {
    fn partition_key(&self) -> String {
        CURSOR_PARTITION.to_owned()
    }

    fn row_key(&self) -> String {
        self.name.clone()
    }
}

/// Durable name to timestamp map.
///
/// `set` is an unconditional overwrite. Only the finalize step of the scan
/// owning a cursor writes it, and at most one scan per driver is ever
/// finalizing.
#[derive(Clone, Debug)]
pub struct CursorStore {
    table: Table<CursorRecord>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn TableStore>, table_name: impl Into<String>) -> Self {
        Self {
            table: Table::new(store, table_name),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await
    }

    /// Returns the stored value or [`CURSOR_MIN`] when the cursor is new.
    pub async fn get(&self, name: &str) -> Result<DateTime<Utc>> {
        Ok(self
            .table
            .get(CURSOR_PARTITION, name)
            .await?
            .map(|stored| stored.row.value)
            .unwrap_or(CURSOR_MIN))
    }

    pub async fn get_many(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut values = HashMap::with_capacity(names.len());
        for name in names {
            values.insert(name.clone(), self.get(name).await?);
        }
        Ok(values)
    }

    pub async fn set(&self, name: &str, value: DateTime<Utc>) -> Result<()> {
        self.table
            .upsert(&CursorRecord {
                name: name.to_owned(),
                value,
            })
            .await?;
        debug!(cursor = name, value = %value, "cursor updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::storage::InMemoryTableStore;

    #[tokio::test]
    async fn missing_cursor_reads_as_minimum_and_set_overwrites() {
        let cursors = CursorStore::new(Arc::new(InMemoryTableStore::new()), "cursors");
        cursors.initialize().await.expect("initialize");

        assert_eq!(cursors.get("CatalogScan-X").await.expect("get"), CURSOR_MIN);

        let later = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let earlier = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        cursors.set("CatalogScan-X", later).await.expect("set later");
        cursors.set("CatalogScan-X", earlier).await.expect("set earlier");

        let values = cursors
            .get_many(&["CatalogScan-X".to_string(), "Other".to_string()])
            .await
            .expect("get many");
        assert_eq!(values["CatalogScan-X"], earlier);
        assert_eq!(values["Other"], CURSOR_MIN);
    }
}
