use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, time::Instant};
use tracing::trace;
use uuid::Uuid;

use super::{DeadLetter, MessageId, MessageQueue, QueueKind, ReceivedMessage};
use crate::error::{InsightsError, Result};

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    delivery_count: u32,
    visible_at: Instant,
    receipt: Option<Uuid>,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: HashMap<QueueKind, Vec<StoredMessage>>,
    dead: HashMap<QueueKind, Vec<DeadLetter>>,
}

/// Process-local queue with visibility timeouts and a poison list.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    state: Mutex<QueueState>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages visible right now.
    pub async fn visible_count(&self, queue: QueueKind) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .await
            .messages
            .get(&queue)
            .map(|messages| messages.iter().filter(|m| m.visible_at <= now).count())
            .unwrap_or_default()
    }

    fn stale(message: &ReceivedMessage) -> InsightsError {
        InsightsError::NotFound(format!(
            "message {} on {} is no longer leased by this receipt",
            message.id, message.queue
        ))
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(
        &self,
        queue: QueueKind,
        body: String,
        visible_after: Duration,
    ) -> Result<MessageId> {
        let id = MessageId::new();
        let mut state = self.state.lock().await;
        state.messages.entry(queue).or_default().push(StoredMessage {
            id,
            body,
            delivery_count: 0,
            visible_at: Instant::now() + visible_after,
            receipt: None,
            enqueued_at: Utc::now(),
        });
        trace!(queue = %queue, message = %id, "message enqueued");
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(messages) = state.messages.get_mut(&queue) else {
            return Ok(None);
        };

        let next = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| m.visible_at);
        let Some(message) = next else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4();
        message.delivery_count += 1;
        message.visible_at = now + visibility_timeout;
        message.receipt = Some(receipt);

        Ok(Some(ReceivedMessage {
            id: message.id,
            queue,
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            receipt,
            enqueued_at: message.enqueued_at,
        }))
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let messages = state.messages.entry(message.queue).or_default();
        let position = messages
            .iter()
            .position(|m| m.id == message.id && m.receipt == Some(message.receipt))
            .ok_or_else(|| Self::stale(message))?;
        messages.remove(position);
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .messages
            .entry(message.queue)
            .or_default()
            .iter_mut()
            .find(|m| m.id == message.id && m.receipt == Some(message.receipt))
            .ok_or_else(|| Self::stale(message))?;
        stored.visible_at = Instant::now() + delay;
        stored.receipt = None;
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let messages = state.messages.entry(message.queue).or_default();
        let position = messages
            .iter()
            .position(|m| m.id == message.id && m.receipt == Some(message.receipt))
            .ok_or_else(|| Self::stale(message))?;
        let stored = messages.remove(position);
        state.dead.entry(message.queue).or_default().push(DeadLetter {
            id: stored.id,
            queue: message.queue,
            body: stored.body,
            delivery_count: stored.delivery_count,
            error: error.to_owned(),
        });
        Ok(())
    }

    async fn approximate_count(&self, queue: QueueKind) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(&queue)
            .map(Vec::len)
            .unwrap_or_default())
    }

    async fn dead_letters(&self, queue: QueueKind) -> Result<Vec<DeadLetter>> {
        Ok(self
            .state
            .lock()
            .await
            .dead
            .get(&queue)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dequeued_message_is_hidden_until_timeout() {
        let queue = InMemoryMessageQueue::new();
        queue
            .enqueue(QueueKind::Work, "a".into(), Duration::ZERO)
            .await
            .expect("enqueue");

        let first = queue
            .dequeue(QueueKind::Work, Duration::from_secs(30))
            .await
            .expect("dequeue")
            .expect("visible");
        assert_eq!(first.delivery_count, 1);
        assert!(
            queue
                .dequeue(QueueKind::Work, Duration::from_secs(30))
                .await
                .expect("dequeue")
                .is_none()
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue
            .dequeue(QueueKind::Work, Duration::from_secs(30))
            .await
            .expect("dequeue")
            .expect("visible again");
        assert_eq!(second.delivery_count, 2);

        // The first receipt is stale now.
        assert!(queue.complete(&first).await.is_err());
        queue.complete(&second).await.expect("complete");
        assert_eq!(queue.approximate_count(QueueKind::Work).await.expect("count"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_and_dead_lettered_messages() {
        let queue = InMemoryMessageQueue::new();
        queue
            .enqueue(QueueKind::Expand, "later".into(), Duration::from_secs(5))
            .await
            .expect("enqueue");
        assert!(
            queue
                .dequeue(QueueKind::Expand, Duration::from_secs(30))
                .await
                .expect("dequeue")
                .is_none()
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        let message = queue
            .dequeue(QueueKind::Expand, Duration::from_secs(30))
            .await
            .expect("dequeue")
            .expect("visible");
        queue.dead_letter(&message, "boom").await.expect("dead letter");

        let dead = queue.dead_letters(QueueKind::Expand).await.expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "later");
        assert_eq!(dead[0].error, "boom");
    }
}
