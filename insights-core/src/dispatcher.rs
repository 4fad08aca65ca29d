//! Routes queue bodies to typed processors and owns the per-message retry
//! policy for batches.
//!
//! Single envelopes propagate processing errors so the outer queue redelivers
//! them with backoff. Batch envelopes never fail as a whole: failed members
//! are re-enqueued individually right away, and members asking to be tried
//! later are re-enqueued with their delay. Members that do not decode are
//! re-enqueued as they are, so only they end up dead-lettered.

use std::{
    any::type_name,
    collections::{BTreeMap, HashMap},
    fmt,
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize as _;
use serde_json::Value;
use tracing::{Instrument, debug_span, error, warn};

use crate::{
    error::{InsightsError, Result},
    messages::{Envelope, Message},
    queue::MessageEnqueuer,
};

/// Handles one message at a time. Errors mean "redeliver me".
#[async_trait]
pub trait MessageProcessor<M: Message>: Send + Sync {
    async fn process(&self, message: &M, delivery_count: u32) -> Result<()>;
}

/// Handles many messages at once and reports per-message outcomes.
#[async_trait]
pub trait BatchMessageProcessor<M: Message>: Send + Sync {
    async fn process_batch(
        &self,
        messages: Vec<M>,
        delivery_count: u32,
    ) -> Result<BatchOutcome<M>>;
}

/// Messages from a batch that did not succeed. Everything not listed
/// succeeded.
#[derive(Clone, Debug)]
pub struct BatchOutcome<M> {
    pub failed: Vec<M>,
    pub try_again_later: BTreeMap<Duration, Vec<M>>,
}

impl<M> Default for BatchOutcome<M> {
    fn default() -> Self {
        Self {
            failed: Vec::new(),
            try_again_later: BTreeMap::new(),
        }
    }
}

impl<M> BatchOutcome<M> {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.try_again_later.is_empty()
    }

    pub fn fail(&mut self, message: M) {
        self.failed.push(message);
    }

    pub fn retry_after(&mut self, delay: Duration, message: M) {
        self.try_again_later.entry(delay).or_default().push(message);
    }

    pub fn try_again_later_count(&self) -> usize {
        self.try_again_later.values().map(Vec::len).sum()
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn process_single(&self, data: Value, delivery_count: u32) -> Result<()>;
    async fn process_batch(&self, data: Vec<Value>, delivery_count: u32) -> Result<()>;
}

struct TypedHandler<M: Message> {
    single: Option<Arc<dyn MessageProcessor<M>>>,
    batch: Option<Arc<dyn BatchMessageProcessor<M>>>,
    enqueuer: Arc<MessageEnqueuer>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> TypedHandler<M> {
    /// Splits batch members into the ones that decode as `M` and the raw
    /// payloads that do not.
    fn decode_each(data: Vec<Value>) -> (Vec<M>, Vec<Value>) {
        let mut messages = Vec::with_capacity(data.len());
        let mut undecodable = Vec::new();
        for value in data {
            match M::deserialize(&value) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    warn!(schema = M::SCHEMA, "batch member does not decode: {err}");
                    undecodable.push(value);
                }
            }
        }
        (messages, undecodable)
    }

    /// Sends members that do not decode back as single messages. They fail
    /// alone on their next delivery instead of taking the batch with them.
    async fn isolate(&self, undecodable: Vec<Value>) -> Result<()> {
        if undecodable.is_empty() {
            return Ok(());
        }
        error!(
            schema = M::SCHEMA,
            count = undecodable.len(),
            "undecodable batch members; re-enqueueing individually"
        );
        self.enqueuer
            .enqueue_raw_individually::<M>(undecodable, Duration::ZERO)
            .await
    }

    async fn requeue(&self, outcome: BatchOutcome<M>) -> Result<()> {
        if !outcome.failed.is_empty() {
            error!(
                schema = M::SCHEMA,
                failed = outcome.failed.len(),
                "batch messages failed; re-enqueueing individually"
            );
            self.enqueuer
                .enqueue_individually(&outcome.failed, Duration::ZERO)
                .await?;
        }
        for (delay, messages) in outcome.try_again_later {
            warn!(
                schema = M::SCHEMA,
                count = messages.len(),
                delay_ms = delay.as_millis() as u64,
                "batch messages will be tried again later"
            );
            self.enqueuer.enqueue_individually(&messages, delay).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<M: Message> ErasedHandler for TypedHandler<M> {
    async fn process_single(&self, data: Value, delivery_count: u32) -> Result<()> {
        let message: M = serde_json::from_value(data)?;

        if let Some(single) = &self.single {
            return single.process(&message, delivery_count).await;
        }

        let Some(batch) = &self.batch else {
            return Err(InsightsError::Internal(format!(
                "no processor registered for '{}'",
                M::SCHEMA
            )));
        };

        let outcome = batch.process_batch(vec![message], delivery_count).await?;
        if !outcome.failed.is_empty() {
            return Err(InsightsError::Internal(format!(
                "batch processor reported the single '{}' message as failed",
                M::SCHEMA
            )));
        }
        for (delay, messages) in outcome.try_again_later {
            self.enqueuer.enqueue_individually(&messages, delay).await?;
        }
        Ok(())
    }

    async fn process_batch(&self, data: Vec<Value>, delivery_count: u32) -> Result<()> {
        let (messages, undecodable) = Self::decode_each(data);
        self.isolate(undecodable).await?;
        if messages.is_empty() {
            return Ok(());
        }

        if delivery_count > 1 {
            // A batch that already failed once is broken apart so each member
            // gets its own retry budget.
            warn!(
                schema = M::SCHEMA,
                count = messages.len(),
                delivery_count,
                "redelivered batch; splitting into single messages"
            );
            return self
                .enqueuer
                .enqueue_individually(&messages, Duration::ZERO)
                .await;
        }

        let outcome = match (&self.batch, &self.single) {
            (Some(batch), _) => {
                let copies = messages.clone();
                match batch.process_batch(messages, delivery_count).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(
                            schema = M::SCHEMA,
                            count = copies.len(),
                            "batch processor failed; all messages marked failed: {err}"
                        );
                        BatchOutcome {
                            failed: copies,
                            try_again_later: BTreeMap::new(),
                        }
                    }
                }
            }
            (None, Some(single)) => {
                let mut outcome = BatchOutcome::success();
                for message in messages {
                    if let Err(err) = single.process(&message, delivery_count).await {
                        warn!(schema = M::SCHEMA, "message in batch failed: {err}");
                        outcome.fail(message);
                    }
                }
                outcome
            }
            (None, None) => {
                return Err(InsightsError::Internal(format!(
                    "no processor registered for '{}'",
                    M::SCHEMA
                )));
            }
        };

        self.requeue(outcome).await
    }
}

struct Registration {
    version: u32,
    handler: Arc<dyn ErasedHandler>,
    processor_type: &'static str,
}

/// Schema-keyed registry of typed handlers.
pub struct MessageDispatcher {
    handlers: HashMap<&'static str, Registration>,
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemas: Vec<(&str, u32, &str)> = self
            .handlers
            .iter()
            .map(|(schema, reg)| (*schema, reg.version, reg.processor_type))
            .collect();
        schemas.sort();
        f.debug_struct("MessageDispatcher")
            .field("schemas", &schemas)
            .finish()
    }
}

impl MessageDispatcher {
    pub fn builder(enqueuer: Arc<MessageEnqueuer>) -> MessageDispatcherBuilder {
        MessageDispatcherBuilder {
            enqueuer,
            handlers: HashMap::new(),
        }
    }

    pub fn schemas(&self) -> Vec<&'static str> {
        let mut schemas: Vec<&'static str> = self.handlers.keys().copied().collect();
        schemas.sort_unstable();
        schemas
    }

    /// Decodes a queue body and runs the registered processor.
    pub async fn dispatch(&self, body: &str, delivery_count: u32) -> Result<()> {
        let envelope = Envelope::parse(body)?;
        let schema = envelope.schema().to_owned();
        let version = envelope.version();

        let registration = self
            .handlers
            .get(schema.as_str())
            .filter(|reg| reg.version == version)
            .ok_or_else(|| InsightsError::UnsupportedMessage {
                schema: schema.clone(),
                version,
            })?;

        let span = debug_span!(
            "dispatch",
            schema = %schema,
            count = envelope.len(),
            delivery_count
        );
        match envelope {
            Envelope::Single { data, .. } => {
                registration
                    .handler
                    .process_single(data, delivery_count)
                    .instrument(span)
                    .await
            }
            Envelope::Batch { mut data, .. } if data.len() == 1 => {
                let only = data.pop().unwrap_or(Value::Null);
                registration
                    .handler
                    .process_single(only, delivery_count)
                    .instrument(span)
                    .await
            }
            Envelope::Batch { data, .. } => {
                registration
                    .handler
                    .process_batch(data, delivery_count)
                    .instrument(span)
                    .await
            }
        }
    }
}

pub struct MessageDispatcherBuilder {
    enqueuer: Arc<MessageEnqueuer>,
    handlers: HashMap<&'static str, Registration>,
}

impl fmt::Debug for MessageDispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcherBuilder")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl MessageDispatcherBuilder {
    pub fn register<M: Message>(self, processor: Arc<dyn MessageProcessor<M>>) -> Self {
        self.insert::<M>(Some(processor), None, type_name::<M>())
    }

    pub fn register_batch<M: Message>(
        self,
        processor: Arc<dyn BatchMessageProcessor<M>>,
    ) -> Self {
        self.insert::<M>(None, Some(processor), type_name::<M>())
    }

    /// Registers both paths: the batch processor handles batches, the single
    /// processor handles single envelopes.
    pub fn register_both<M: Message>(
        self,
        single: Arc<dyn MessageProcessor<M>>,
        batch: Arc<dyn BatchMessageProcessor<M>>,
    ) -> Self {
        self.insert::<M>(Some(single), Some(batch), type_name::<M>())
    }

    fn insert<M: Message>(
        mut self,
        single: Option<Arc<dyn MessageProcessor<M>>>,
        batch: Option<Arc<dyn BatchMessageProcessor<M>>>,
        processor_type: &'static str,
    ) -> Self {
        let handler = TypedHandler::<M> {
            single,
            batch,
            enqueuer: Arc::clone(&self.enqueuer),
            _message: PhantomData,
        };
        self.handlers.insert(
            M::SCHEMA,
            Registration {
                version: M::VERSION,
                handler: Arc::new(handler),
                processor_type,
            },
        );
        self
    }

    pub fn build(self) -> MessageDispatcher {
        MessageDispatcher {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        config::QueueConfig,
        queue::{InMemoryMessageQueue, MessageQueue, QueueKind},
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        n: u32,
    }

    impl Message for Item {
        const SCHEMA: &'static str = "item";
        const QUEUE: QueueKind = QueueKind::Work;
    }

    #[derive(Default)]
    struct FailsOnThree {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageProcessor<Item> for FailsOnThree {
        async fn process(&self, message: &Item, _delivery_count: u32) -> Result<()> {
            self.seen.lock().expect("lock").push(message.n);
            if message.n == 3 {
                return Err(InsightsError::Internal("three always fails".into()));
            }
            Ok(())
        }
    }

    struct ExplodingBatch;

    #[async_trait]
    impl BatchMessageProcessor<Item> for ExplodingBatch {
        async fn process_batch(
            &self,
            _messages: Vec<Item>,
            _delivery_count: u32,
        ) -> Result<BatchOutcome<Item>> {
            Err(InsightsError::Internal("boom".into()))
        }
    }

    struct DefersEven;

    #[async_trait]
    impl BatchMessageProcessor<Item> for DefersEven {
        async fn process_batch(
            &self,
            messages: Vec<Item>,
            _delivery_count: u32,
        ) -> Result<BatchOutcome<Item>> {
            let mut outcome = BatchOutcome::success();
            for message in messages {
                if message.n % 2 == 0 {
                    outcome.retry_after(Duration::from_secs(u64::from(message.n)), message);
                }
            }
            Ok(outcome)
        }
    }

    fn fixture() -> (Arc<InMemoryMessageQueue>, Arc<MessageEnqueuer>) {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let enqueuer = Arc::new(MessageEnqueuer::new(
            queue.clone(),
            QueueConfig::default(),
        ));
        (queue, enqueuer)
    }

    fn batch_body(ns: &[u32]) -> String {
        let items: Vec<Item> = ns.iter().map(|n| Item { n: *n }).collect();
        Envelope::batch(&items)
            .and_then(|e| e.to_body())
            .expect("batch body")
    }

    async fn pending_items(queue: &InMemoryMessageQueue) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(message) = queue
            .dequeue(QueueKind::Work, Duration::from_secs(60))
            .await
            .expect("dequeue")
        {
            match Envelope::parse(&message.body).expect("envelope") {
                Envelope::Single { data, .. } => {
                    out.push(serde_json::from_value::<Item>(data).expect("item").n)
                }
                other => panic!("expected single envelope, got {other:?}"),
            }
            queue.complete(&message).await.expect("complete");
        }
        out.sort_unstable();
        out
    }

    #[tokio::test]
    async fn only_the_failing_member_is_requeued() {
        let (queue, enqueuer) = fixture();
        let processor = Arc::new(FailsOnThree::default());
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(processor.clone())
            .build();

        dispatcher
            .dispatch(&batch_body(&[1, 2, 3, 4, 5]), 1)
            .await
            .expect("batch never fails as a whole");

        assert_eq!(*processor.seen.lock().expect("lock"), vec![1, 2, 3, 4, 5]);
        assert_eq!(pending_items(&queue).await, vec![3]);
    }

    #[tokio::test]
    async fn single_message_failure_propagates() {
        let (_queue, enqueuer) = fixture();
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(Arc::new(FailsOnThree::default()))
            .build();

        let body = Envelope::single(&Item { n: 3 })
            .and_then(|e| e.to_body())
            .expect("body");
        assert!(dispatcher.dispatch(&body, 1).await.is_err());
    }

    #[tokio::test]
    async fn batch_processor_error_fails_every_member() {
        let (queue, enqueuer) = fixture();
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register_batch::<Item>(Arc::new(ExplodingBatch))
            .build();

        dispatcher
            .dispatch(&batch_body(&[1, 2, 3]), 1)
            .await
            .expect("batch errors are absorbed");
        assert_eq!(pending_items(&queue).await, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn try_again_later_is_delayed() {
        let (queue, enqueuer) = fixture();
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register_batch::<Item>(Arc::new(DefersEven))
            .build();

        dispatcher
            .dispatch(&batch_body(&[1, 2, 3, 4]), 1)
            .await
            .expect("dispatch");
        assert!(pending_items(&queue).await.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pending_items(&queue).await, vec![2]);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pending_items(&queue).await, vec![4]);
    }

    #[tokio::test]
    async fn redelivered_batch_is_split() {
        let (queue, enqueuer) = fixture();
        let processor = Arc::new(FailsOnThree::default());
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(processor.clone())
            .build();

        dispatcher
            .dispatch(&batch_body(&[7, 8]), 2)
            .await
            .expect("split");
        assert!(processor.seen.lock().expect("lock").is_empty());
        assert_eq!(pending_items(&queue).await, vec![7, 8]);
    }

    const MIXED_BATCH: &str =
        r#"{"k":"batch","n":"item","v":1,"d":[{"n":1},{"n":2},{"bad":true},{"n":4},{"n":5}]}"#;

    #[tokio::test]
    async fn undecodable_member_does_not_sink_its_batch() {
        let (queue, enqueuer) = fixture();
        let processor = Arc::new(FailsOnThree::default());
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(processor.clone())
            .build();

        dispatcher
            .dispatch(MIXED_BATCH, 1)
            .await
            .expect("good members are processed");
        assert_eq!(*processor.seen.lock().expect("lock"), vec![1, 2, 4, 5]);

        let isolated = queue
            .dequeue(QueueKind::Work, Duration::from_secs(60))
            .await
            .expect("dequeue")
            .expect("bad member re-enqueued");
        assert!(
            queue
                .dequeue(QueueKind::Work, Duration::from_secs(60))
                .await
                .expect("dequeue")
                .is_none()
        );
        assert_eq!(
            Envelope::parse(&isolated.body).expect("envelope"),
            Envelope::Single {
                schema: "item".into(),
                version: 1,
                data: serde_json::json!({"bad": true}),
            }
        );

        // On its own it fails permanently, so only it is dead-lettered.
        let err = dispatcher
            .dispatch(&isolated.body, 1)
            .await
            .expect_err("still undecodable");
        assert!(matches!(err, InsightsError::Serialization(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn redelivered_batch_split_keeps_undecodable_member_apart() {
        let (queue, enqueuer) = fixture();
        let processor = Arc::new(FailsOnThree::default());
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(processor.clone())
            .build();

        dispatcher.dispatch(MIXED_BATCH, 2).await.expect("split");
        assert!(processor.seen.lock().expect("lock").is_empty());

        let mut bodies = Vec::new();
        while let Some(message) = queue
            .dequeue(QueueKind::Work, Duration::from_secs(60))
            .await
            .expect("dequeue")
        {
            bodies.push(message.body.clone());
            queue.complete(&message).await.expect("complete");
        }
        assert_eq!(bodies.len(), 5);
        let mut failures = 0;
        for body in &bodies {
            if dispatcher.dispatch(body, 1).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
        let mut seen = processor.seen.lock().expect("lock").clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn unknown_schema_or_version_is_rejected() {
        let (_queue, enqueuer) = fixture();
        let dispatcher = MessageDispatcher::builder(enqueuer)
            .register::<Item>(Arc::new(FailsOnThree::default()))
            .build();

        let err = dispatcher
            .dispatch(r#"{"k":"single","n":"other","v":1,"d":{}}"#, 1)
            .await
            .expect_err("unknown schema");
        assert!(matches!(err, InsightsError::UnsupportedMessage { .. }));
        assert!(!err.is_transient());

        let err = dispatcher
            .dispatch(r#"{"k":"single","n":"item","v":9,"d":{"n":1}}"#, 1)
            .await
            .expect_err("unknown version");
        assert!(matches!(err, InsightsError::UnsupportedMessage { version: 9, .. }));
    }
}
