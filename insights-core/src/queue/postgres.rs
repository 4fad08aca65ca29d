//! Durable [`MessageQueue`] backed by Postgres.
//!
//! Dequeue claims the oldest visible row with `FOR UPDATE SKIP LOCKED` and
//! pushes its visibility forward, so concurrent workers never receive the
//! same delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DeadLetter, MessageId, MessageQueue, QueueKind, ReceivedMessage};
use crate::error::{InsightsError, Result};

#[derive(Clone, Debug)]
pub struct PostgresMessageQueue {
    pool: PgPool,
}

impl PostgresMessageQueue {
    /// The schema comes from the table store migrations.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn millis(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }

    fn parse_queue(value: &str) -> Result<QueueKind> {
        match value {
            "expand" => Ok(QueueKind::Expand),
            "work" => Ok(QueueKind::Work),
            other => Err(InsightsError::Internal(format!(
                "queue table returned unknown queue '{other}'"
            ))),
        }
    }

    fn stale(message: &ReceivedMessage) -> InsightsError {
        InsightsError::NotFound(format!(
            "message {} on {} is no longer leased by this receipt",
            message.id, message.queue
        ))
    }
}

#[async_trait]
impl MessageQueue for PostgresMessageQueue {
    async fn enqueue(
        &self,
        queue: QueueKind,
        body: String,
        visible_after: Duration,
    ) -> Result<MessageId> {
        let id = MessageId::new();
        sqlx::query(
            r#"
            INSERT INTO insights_messages (id, queue, body, visible_at)
            VALUES ($1, $2, $3, NOW() + ($4::bigint) * INTERVAL '1 millisecond')
            "#,
        )
        .bind(id.0)
        .bind(queue.as_str())
        .bind(body)
        .bind(Self::millis(visible_after))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn enqueue_many(
        &self,
        queue: QueueKind,
        bodies: Vec<String>,
        visible_after: Duration,
    ) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            let id = MessageId::new();
            sqlx::query(
                r#"
                INSERT INTO insights_messages (id, queue, body, visible_at)
                VALUES ($1, $2, $3, NOW() + ($4::bigint) * INTERVAL '1 millisecond')
                "#,
            )
            .bind(id.0)
            .bind(queue.as_str())
            .bind(body)
            .bind(Self::millis(visible_after))
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn dequeue(
        &self,
        queue: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let receipt = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM insights_messages
                WHERE queue = $1
                  AND state = 'ready'
                  AND visible_at <= NOW()
                ORDER BY visible_at, enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE insights_messages m
            SET delivery_count = m.delivery_count + 1,
                receipt = $2,
                visible_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond'
            FROM next
            WHERE m.id = next.id
            RETURNING m.id, m.queue, m.body, m.delivery_count, m.enqueued_at
            "#,
        )
        .bind(queue.as_str())
        .bind(receipt)
        .bind(Self::millis(visibility_timeout))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let queue_name: String = row.try_get("queue")?;
        let delivery_count: i32 = row.try_get("delivery_count")?;
        Ok(Some(ReceivedMessage {
            id: MessageId(row.try_get("id")?),
            queue: Self::parse_queue(&queue_name)?,
            body: row.try_get("body")?,
            delivery_count: u32::try_from(delivery_count).unwrap_or_default(),
            receipt,
            enqueued_at: row.try_get::<DateTime<Utc>, _>("enqueued_at")?,
        }))
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM insights_messages WHERE id = $1 AND receipt = $2 AND state = 'ready'",
        )
        .bind(message.id.0)
        .bind(message.receipt)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Self::stale(message));
        }
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage, delay: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE insights_messages
            SET receipt = NULL,
                visible_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond'
            WHERE id = $1 AND receipt = $2 AND state = 'ready'
            "#,
        )
        .bind(message.id.0)
        .bind(message.receipt)
        .bind(Self::millis(delay))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Self::stale(message));
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE insights_messages
            SET state = 'dead_letter', receipt = NULL, last_error = $3
            WHERE id = $1 AND receipt = $2 AND state = 'ready'
            "#,
        )
        .bind(message.id.0)
        .bind(message.receipt)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Self::stale(message));
        }
        Ok(())
    }

    async fn approximate_count(&self, queue: QueueKind) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM insights_messages WHERE queue = $1 AND state = 'ready'",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn dead_letters(&self, queue: QueueKind) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, delivery_count, COALESCE(last_error, '') AS last_error
            FROM insights_messages
            WHERE queue = $1 AND state = 'dead_letter'
            ORDER BY enqueued_at
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter> {
                let delivery_count: i32 = row.try_get("delivery_count")?;
                Ok(DeadLetter {
                    id: MessageId(row.try_get("id")?),
                    queue,
                    body: row.try_get("body")?,
                    delivery_count: u32::try_from(delivery_count).unwrap_or_default(),
                    error: row.try_get("last_error")?,
                })
            })
            .collect()
    }
}
