//! At-least-once message queues.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub mod enqueuer;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use enqueuer::MessageEnqueuer;
pub use memory::InMemoryMessageQueue;

/// Logical queues. Expansion work (index and page scans) is kept apart from
/// leaf work so a flood of leaves never starves the state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Expand,
    Work,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Expand, QueueKind::Work];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Expand => "expand",
            QueueKind::Work => "work",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a worker. It stays invisible to other workers until
/// completed, abandoned, or its visibility timeout lapses.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub queue: QueueKind,
    pub body: String,
    /// Starts at 1 for the first delivery.
    pub delivery_count: u32,
    /// Identifies this particular delivery; stale receipts are rejected.
    pub receipt: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub queue: QueueKind,
    pub body: String,
    pub delivery_count: u32,
    pub error: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueKind,
        body: String,
        visible_after: Duration,
    ) -> Result<MessageId>;

    /// Enqueue several bodies. Default implementation issues them
    /// one-by-one.
    async fn enqueue_many(
        &self,
        queue: QueueKind,
        bodies: Vec<String>,
        visible_after: Duration,
    ) -> Result<Vec<MessageId>> {
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            ids.push(self.enqueue(queue, body, visible_after).await?);
        }
        Ok(ids)
    }

    async fn dequeue(
        &self,
        queue: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>>;

    async fn complete(&self, message: &ReceivedMessage) -> Result<()>;

    /// Makes the message visible again after `delay`.
    async fn abandon(&self, message: &ReceivedMessage, delay: Duration) -> Result<()>;

    /// Moves the message to the poison area.
    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> Result<()>;

    /// Messages still owned by the queue, visible or not.
    async fn approximate_count(&self, queue: QueueKind) -> Result<usize>;

    async fn dead_letters(&self, queue: QueueKind) -> Result<Vec<DeadLetter>>;
}
