//! Postgres-backed [`TableStore`].
//!
//! All tables share one physical relation keyed by
//! `(table_name, partition_key, row_key)`; keys use the `C` collation so
//! range scans order exactly like the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::info;
use uuid::Uuid;

use super::{Continuation, PartitionFilter, QuerySegment, TableEntity, TableQuery, TableStore};
use crate::error::{InsightsError, Result};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug)]
pub struct PostgresTableStore {
    pool: PgPool,
}

impl PostgresTableStore {
    /// Wraps an existing pool. Call [`PostgresTableStore::migrate`] once
    /// during bootstrap.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("table store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| InsightsError::Internal(format!("migration failed: {e}")))
    }

    fn new_etag() -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn decode(row: PgRow) -> Result<TableEntity> {
        Ok(TableEntity {
            partition_key: row.try_get("partition_key")?,
            row_key: row.try_get("row_key")?,
            etag: row.try_get("etag")?,
            timestamp: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            value: row.try_get::<Value, _>("value")?,
        })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists = sqlx::query("SELECT 1 FROM insights_tables WHERE table_name = $1")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(exists)
    }

    async fn require_table(&self, table: &str) -> Result<()> {
        if self.table_exists(table).await? {
            Ok(())
        } else {
            Err(InsightsError::NotFound(format!(
                "table '{table}' does not exist"
            )))
        }
    }

    fn describe(table: &str, partition_key: &str, row_key: &str) -> String {
        format!("{table}({partition_key}, {row_key})")
    }
}

#[async_trait]
impl TableStore for PostgresTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO insights_tables (table_name) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        sqlx::query("DELETE FROM insights_tables WHERE table_name = $1")
            .bind(table)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>> {
        sqlx::query(
            r#"
            SELECT partition_key, row_key, etag, updated_at, value
            FROM insights_entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::decode)
        .transpose()
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity> {
        self.require_table(table).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO insights_entities
                (table_name, partition_key, row_key, etag, updated_at, value)
            VALUES ($1, $2, $3, $4, NOW(), $5)
            ON CONFLICT DO NOTHING
            RETURNING partition_key, row_key, etag, updated_at, value
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(Self::new_etag())
        .bind(&value)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::decode(row),
            None => Err(InsightsError::Conflict(Self::describe(
                table,
                partition_key,
                row_key,
            ))),
        }
    }

    async fn upsert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<TableEntity> {
        self.require_table(table).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO insights_entities
                (table_name, partition_key, row_key, etag, updated_at, value)
            VALUES ($1, $2, $3, $4, NOW(), $5)
            ON CONFLICT (table_name, partition_key, row_key)
            DO UPDATE SET etag = EXCLUDED.etag,
                          updated_at = EXCLUDED.updated_at,
                          value = EXCLUDED.value
            RETURNING partition_key, row_key, etag, updated_at, value
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(Self::new_etag())
        .bind(&value)
        .fetch_one(&self.pool)
        .await?;
        Self::decode(row)
    }

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
        etag: &str,
    ) -> Result<TableEntity> {
        let row = sqlx::query(
            r#"
            UPDATE insights_entities
            SET etag = $5, updated_at = NOW(), value = $6
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
              AND etag = $4
            RETURNING partition_key, row_key, etag, updated_at, value
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(etag)
        .bind(Self::new_etag())
        .bind(&value)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::decode(row);
        }

        let described = Self::describe(table, partition_key, row_key);
        match self.get(table, partition_key, row_key).await? {
            Some(_) => Err(InsightsError::PreconditionFailed(described)),
            None => Err(InsightsError::NotFound(described)),
        }
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM insights_entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
              AND ($4::text IS NULL OR etag = $4)
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(etag)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if etag.is_some() && self.get(table, partition_key, row_key).await?.is_some() {
            return Err(InsightsError::PreconditionFailed(Self::describe(
                table,
                partition_key,
                row_key,
            )));
        }
        Ok(false)
    }

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QuerySegment> {
        let (exact, lower, upper) = match &query.partition {
            PartitionFilter::All => (None, None, None),
            PartitionFilter::Exact(pk) => (Some(pk.as_str()), None, None),
            PartitionFilter::Range {
                lower_exclusive,
                upper_exclusive,
            } => (
                None,
                Some(lower_exclusive.as_str()),
                Some(upper_exclusive.as_str()),
            ),
        };
        let take = query.take.max(1);
        let like_prefix = query.row_key_prefix.as_ref().map(|prefix| {
            let escaped = prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("{escaped}%")
        });

        // Fetch one extra row to learn whether a continuation is needed.
        let rows = sqlx::query(
            r#"
            SELECT partition_key, row_key, etag, updated_at, value
            FROM insights_entities
            WHERE table_name = $1
              AND ($2::text IS NULL OR partition_key = $2)
              AND ($3::text IS NULL OR partition_key > $3)
              AND ($4::text IS NULL OR partition_key < $4)
              AND ($5::text IS NULL OR row_key > $5)
              AND ($6::text IS NULL OR row_key LIKE $6)
              AND ($7::text IS NULL OR (partition_key, row_key) > ($7, $8))
            ORDER BY partition_key, row_key
            LIMIT $9
            "#,
        )
        .bind(table)
        .bind(exact)
        .bind(lower)
        .bind(upper)
        .bind(query.row_key_after.as_deref())
        .bind(like_prefix)
        .bind(continuation.map(|c| c.partition_key.as_str()))
        .bind(continuation.map(|c| c.row_key.as_str()).unwrap_or_default())
        .bind((take + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entities = rows
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>>>()?;
        let has_more = entities.len() > take;
        entities.truncate(take);

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
