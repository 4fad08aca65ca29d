use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use tracing::debug;

use super::MessageQueue;
use crate::{
    config::QueueConfig,
    error::Result,
    messages::{Envelope, Message},
};

/// Serializes typed messages into envelopes and routes them to their queue.
///
/// Bulk enqueues above the configured threshold are packed into batch
/// envelopes. Messages sharing a [`Message::batch_key`] are kept together so
/// work for one package travels as a unit.
#[derive(Clone)]
pub struct MessageEnqueuer {
    queue: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl std::fmt::Debug for MessageEnqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEnqueuer")
            .field("allow_batching", &self.config.allow_batching)
            .field("bulk_enqueue_threshold", &self.config.bulk_enqueue_threshold)
            .field("max_batch_size", &self.config.max_batch_size)
            .field("disable_message_delay", &self.config.disable_message_delay)
            .finish()
    }
}

impl MessageEnqueuer {
    pub fn new(queue: Arc<dyn MessageQueue>, config: QueueConfig) -> Self {
        Self { queue, config }
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub async fn enqueue<M: Message>(&self, messages: &[M]) -> Result<()> {
        self.enqueue_with_delay(messages, Duration::ZERO).await
    }

    pub async fn enqueue_with_delay<M: Message>(
        &self,
        messages: &[M],
        delay: Duration,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let batching = self.config.allow_batching
            && messages.len() >= self.config.bulk_enqueue_threshold.max(2);
        if !batching {
            return self.enqueue_individually(messages, delay).await;
        }

        let mut bodies = Vec::new();
        for batch in self.pack(messages) {
            let envelope = if batch.len() == 1 {
                Envelope::single(batch[0])?
            } else {
                Envelope::Batch {
                    schema: M::SCHEMA.to_owned(),
                    version: M::VERSION,
                    data: batch
                        .iter()
                        .map(|m| serde_json::to_value(m))
                        .collect::<std::result::Result<_, _>>()?,
                }
            };
            bodies.push(envelope.to_body()?);
        }

        debug!(
            schema = M::SCHEMA,
            messages = messages.len(),
            envelopes = bodies.len(),
            "enqueueing batched messages"
        );
        self.queue
            .enqueue_many(M::QUEUE, bodies, self.effective_delay(delay))
            .await?;
        Ok(())
    }

    /// One envelope per message, never batched.
    pub async fn enqueue_individually<M: Message>(
        &self,
        messages: &[M],
        delay: Duration,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let bodies = messages
            .iter()
            .map(|m| Envelope::single(m).and_then(|e| e.to_body()))
            .collect::<Result<Vec<_>>>()?;
        self.queue
            .enqueue_many(M::QUEUE, bodies, self.effective_delay(delay))
            .await?;
        Ok(())
    }

    /// Wraps raw payloads in single `M` envelopes without decoding them, so a
    /// payload that does not parse still travels, and fails, on its own.
    pub async fn enqueue_raw_individually<M: Message>(
        &self,
        payloads: Vec<Value>,
        delay: Duration,
    ) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let bodies = payloads
            .into_iter()
            .map(|data| {
                Envelope::Single {
                    schema: M::SCHEMA.to_owned(),
                    version: M::VERSION,
                    data,
                }
                .to_body()
            })
            .collect::<Result<Vec<_>>>()?;
        self.queue
            .enqueue_many(M::QUEUE, bodies, self.effective_delay(delay))
            .await?;
        Ok(())
    }

    fn effective_delay(&self, delay: Duration) -> Duration {
        if self.config.disable_message_delay {
            Duration::ZERO
        } else {
            delay
        }
    }

    /// Groups by batch key in order of first appearance, then fills batches
    /// up to the size limit without splitting a group unless it alone
    /// exceeds the limit.
    fn pack<'a, M: Message>(&self, messages: &'a [M]) -> Vec<Vec<&'a M>> {
        let max = self.config.max_batch_size.max(1);

        let mut groups: Vec<Vec<&M>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for message in messages {
            match message.batch_key() {
                Some(key) => {
                    let slot = *index.entry(key).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].push(message);
                }
                None => groups.push(vec![message]),
            }
        }

        let mut batches: Vec<Vec<&M>> = Vec::new();
        let mut current: Vec<&M> = Vec::new();
        for group in groups {
            if !current.is_empty() && current.len() + group.len() > max {
                batches.push(std::mem::take(&mut current));
            }
            for message in group {
                if current.len() == max {
                    batches.push(std::mem::take(&mut current));
                }
                current.push(message);
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::queue::{InMemoryMessageQueue, QueueKind};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Leaf {
        id: String,
        version: u32,
    }

    impl Message for Leaf {
        const SCHEMA: &'static str = "leaf";
        const QUEUE: QueueKind = QueueKind::Work;

        fn batch_key(&self) -> Option<String> {
            Some(self.id.to_lowercase())
        }
    }

    fn config(max_batch_size: usize) -> QueueConfig {
        QueueConfig {
            bulk_enqueue_threshold: 3,
            max_batch_size,
            ..QueueConfig::default()
        }
    }

    async fn drain(queue: &InMemoryMessageQueue) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(message) = queue
            .dequeue(QueueKind::Work, Duration::from_secs(60))
            .await
            .expect("dequeue")
        {
            out.push(Envelope::parse(&message.body).expect("envelope"));
            queue.complete(&message).await.expect("complete");
        }
        out
    }

    #[tokio::test]
    async fn small_enqueues_stay_single() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let enqueuer = MessageEnqueuer::new(queue.clone(), config(10));
        let leaves = vec![
            Leaf { id: "A".into(), version: 1 },
            Leaf { id: "B".into(), version: 1 },
        ];
        enqueuer.enqueue(&leaves).await.expect("enqueue");

        let envelopes = drain(&queue).await;
        assert_eq!(envelopes.len(), 2);
        assert!(envelopes.iter().all(|e| matches!(e, Envelope::Single { .. })));
    }

    #[tokio::test]
    async fn bulk_enqueue_keeps_package_groups_together() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let enqueuer = MessageEnqueuer::new(queue.clone(), config(3));
        let leaves = vec![
            Leaf { id: "A".into(), version: 1 },
            Leaf { id: "B".into(), version: 1 },
            Leaf { id: "a".into(), version: 2 },
            Leaf { id: "B".into(), version: 2 },
            Leaf { id: "C".into(), version: 1 },
        ];
        enqueuer.enqueue(&leaves).await.expect("enqueue");

        let envelopes = drain(&queue).await;
        let batches: Vec<Vec<String>> = envelopes
            .into_iter()
            .map(|envelope| match envelope {
                Envelope::Batch { data, .. } => data
                    .into_iter()
                    .map(|v| v["id"].as_str().unwrap_or_default().to_string())
                    .collect(),
                Envelope::Single { data, .. } => {
                    vec![data["id"].as_str().unwrap_or_default().to_string()]
                }
            })
            .collect();

        assert_eq!(
            batches,
            vec![
                vec!["A".to_string(), "a".to_string()],
                vec!["B".to_string(), "B".to_string(), "C".to_string()],
            ]
        );
    }
}
