//! Wiring for every long-lived service, built once per process.

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    catalog::{CatalogClient, HttpCatalogClient, RemoteCursorClient},
    config::{InsightsConfig, StorageBackend},
    cursor::CursorStore,
    dispatcher::MessageDispatcher,
    drivers::{LatestLeafDriver, VersionSetDriver},
    error::{InsightsError, Result},
    lease::{AutoRenewingLeaseService, LeaseService},
    queue::{InMemoryMessageQueue, MessageEnqueuer, MessageQueue, QueueKind},
    scan::{
        AggregateBucketMessage, AggregateBucketProcessor, CatalogIndexScanMessage,
        CatalogIndexScanProcessor, CatalogLeafScanMessage, CatalogLeafScanProcessor,
        CatalogPageScanMessage, CatalogPageScanProcessor, CatalogScanContext, CatalogScanDriver,
        CatalogScanService, CatalogScanStorage, DriverRegistry,
    },
    storage::{InMemoryTableStore, TableStore, TaskStateStore},
    table_scan::{
        TableCopyDriver, TableScanDriver, TableScanMessage, TableScanService,
        TableScanStepProcessor,
    },
    timer::{CatalogScanUpdateTimer, Timer, TimerExecutionService},
};

pub struct InsightsServices {
    config: InsightsConfig,
    store: Arc<dyn TableStore>,
    queue: Arc<dyn MessageQueue>,
    enqueuer: Arc<MessageEnqueuer>,
    leases: Arc<LeaseService>,
    scan_service: Arc<CatalogScanService>,
    table_scans: Arc<TableScanService>,
    dispatcher: Arc<MessageDispatcher>,
    timers: Arc<TimerExecutionService>,
    shutdown: CancellationToken,
}

impl fmt::Debug for InsightsServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsServices")
            .field("storage_backend", &self.config.storage.backend)
            .field("dispatcher", &self.dispatcher)
            .field("timers", &self.timers)
            .field("lease_owner", &self.leases.owner())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl InsightsServices {
    pub fn builder(config: InsightsConfig) -> InsightsServicesBuilder {
        InsightsServicesBuilder::new(config)
    }

    pub fn config(&self) -> &InsightsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn enqueuer(&self) -> &Arc<MessageEnqueuer> {
        &self.enqueuer
    }

    pub fn leases(&self) -> &Arc<LeaseService> {
        &self.leases
    }

    pub fn scan_service(&self) -> &Arc<CatalogScanService> {
        &self.scan_service
    }

    pub fn table_scans(&self) -> &Arc<TableScanService> {
        &self.table_scans
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn timers(&self) -> &Arc<TimerExecutionService> {
        &self.timers
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Creates tables and runs driver and timer initialization. Safe to call
    /// on every start.
    pub async fn initialize(&self) -> Result<()> {
        self.leases.initialize().await?;
        self.scan_service.initialize().await?;
        self.timers.initialize().await?;
        info!("insights services initialized");
        Ok(())
    }

    /// Receives and dispatches one message from `kind`. Returns `false` when
    /// nothing was visible.
    ///
    /// Failures are redelivered with exponential backoff until the retry
    /// budget runs out; contract violations go straight to the dead-letter
    /// area.
    pub async fn process_next(&self, kind: QueueKind) -> Result<bool> {
        let Some(message) = self
            .queue
            .dequeue(kind, self.config.queue.visibility_timeout())
            .await?
        else {
            return Ok(false);
        };

        match self
            .dispatcher
            .dispatch(&message.body, message.delivery_count)
            .await
        {
            Ok(()) => self.queue.complete(&message).await?,
            Err(err) if !err.is_transient() => {
                error!(
                    queue = %kind,
                    message = %message.id,
                    "message cannot be processed; dead-lettering: {err}"
                );
                self.queue.dead_letter(&message, &err.to_string()).await?;
            }
            Err(err) if message.delivery_count >= self.config.retry.max_attempts => {
                error!(
                    queue = %kind,
                    message = %message.id,
                    delivery_count = message.delivery_count,
                    "retry budget exhausted; dead-lettering: {err}"
                );
                self.queue.dead_letter(&message, &err.to_string()).await?;
            }
            Err(err) => {
                let delay = if self.config.queue.disable_message_delay {
                    std::time::Duration::ZERO
                } else {
                    self.config
                        .retry
                        .backoff_for(message.delivery_count, &mut rand::rng())
                };
                warn!(
                    queue = %kind,
                    message = %message.id,
                    delivery_count = message.delivery_count,
                    retry_in_ms = delay.as_millis() as u64,
                    "message failed; will retry: {err}"
                );
                self.queue.abandon(&message, delay).await?;
            }
        }
        Ok(true)
    }

    /// Drains both queues until neither has a visible message or `limit`
    /// messages were handled. Returns the number handled.
    pub async fn process_until_idle(&self, limit: usize) -> Result<usize> {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            for kind in QueueKind::ALL {
                if processed >= limit {
                    return Ok(processed);
                }
                if self.process_next(kind).await? {
                    processed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }
}

pub struct InsightsServicesBuilder {
    config: InsightsConfig,
    store: Option<Arc<dyn TableStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    catalog: Option<Arc<dyn CatalogClient>>,
    remote_cursors: Option<Arc<dyn RemoteCursorClient>>,
    drivers: Vec<Arc<dyn CatalogScanDriver>>,
    table_scan_drivers: Vec<Arc<dyn TableScanDriver>>,
    default_drivers: bool,
    timers: Vec<Arc<dyn Timer>>,
    lease_owner: Option<String>,
    shutdown: CancellationToken,
}

impl fmt::Debug for InsightsServicesBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsServicesBuilder")
            .field("store", &self.store.is_some())
            .field("queue", &self.queue.is_some())
            .field("catalog", &self.catalog.is_some())
            .field("remote_cursors", &self.remote_cursors.is_some())
            .field("drivers", &self.drivers.len())
            .field("table_scan_drivers", &self.table_scan_drivers.len())
            .field("default_drivers", &self.default_drivers)
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl InsightsServicesBuilder {
    pub fn new(config: InsightsConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            catalog: None,
            remote_cursors: None,
            drivers: Vec::new(),
            table_scan_drivers: Vec::new(),
            default_drivers: true,
            timers: Vec::new(),
            lease_owner: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogClient>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_remote_cursors(mut self, remote_cursors: Arc<dyn RemoteCursorClient>) -> Self {
        self.remote_cursors = Some(remote_cursors);
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn CatalogScanDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    pub fn with_table_scan_driver(mut self, driver: Arc<dyn TableScanDriver>) -> Self {
        self.table_scan_drivers.push(driver);
        self
    }

    /// Skips registering the built-in drivers.
    pub fn without_default_drivers(mut self) -> Self {
        self.default_drivers = false;
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timers.push(timer);
        self
    }

    pub fn with_lease_owner(mut self, owner: impl Into<String>) -> Self {
        self.lease_owner = Some(owner.into());
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Opens the storage backend named in the configuration. Explicitly
    /// supplied stores and queues win.
    pub async fn with_configured_storage(self) -> Result<Self> {
        let backend = self.config.storage.backend;
        match backend {
            StorageBackend::Memory => Ok(self),
            #[cfg(feature = "postgres")]
            StorageBackend::Postgres => {
                use crate::{
                    queue::postgres::PostgresMessageQueue, storage::postgres::PostgresTableStore,
                };

                let mut this = self;
                let url = this.config.storage.database_url.clone().ok_or_else(|| {
                    InsightsError::InvalidArgument(
                        "storage.database_url is required for the postgres backend".into(),
                    )
                })?;
                let max_connections = this.config.storage.max_connections.unwrap_or(10);
                let store = PostgresTableStore::connect(&url, max_connections).await?;
                store.migrate().await?;
                if this.queue.is_none() {
                    this.queue = Some(Arc::new(PostgresMessageQueue::new(store.pool().clone())));
                }
                if this.store.is_none() {
                    this.store = Some(Arc::new(store));
                }
                Ok(this)
            }
            #[cfg(not(feature = "postgres"))]
            StorageBackend::Postgres => Err(InsightsError::InvalidArgument(
                "postgres storage requires the `postgres` feature".into(),
            )),
        }
    }

    pub fn build(self) -> Result<InsightsServices> {
        let config = self.config;
        let store: Arc<dyn TableStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTableStore::new()));
        let queue: Arc<dyn MessageQueue> = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryMessageQueue::new()));

        let mut http = None;
        let catalog: Arc<dyn CatalogClient> = match self.catalog {
            Some(catalog) => catalog,
            None => shared_http_client(&mut http, &config)?,
        };
        let remote_cursors: Arc<dyn RemoteCursorClient> = match self.remote_cursors {
            Some(remote) => remote,
            None => shared_http_client(&mut http, &config)?,
        };

        let enqueuer = Arc::new(MessageEnqueuer::new(Arc::clone(&queue), config.queue.clone()));
        let leases = Arc::new(LeaseService::new(
            Arc::clone(&store),
            config.tables.leases.clone(),
            config.lease.duration(),
            self.lease_owner,
        ));

        let mut registry = DriverRegistry::new();
        if self.default_drivers {
            registry.register(Arc::new(LatestLeafDriver::new(
                Arc::clone(&store),
                config.tables.latest_package_leaves.clone(),
            )))?;
            registry.register(Arc::new(VersionSetDriver::new(
                Arc::clone(&store),
                &config.tables,
            )))?;
        }
        for driver in self.drivers {
            registry.register(driver)?;
        }

        let context = CatalogScanContext {
            drivers: Arc::new(registry),
            storage: CatalogScanStorage::new(Arc::clone(&store), config.tables.clone()),
            cursors: CursorStore::new(Arc::clone(&store), config.tables.cursors.clone()),
            task_states: TaskStateStore::new(Arc::clone(&store), config.tables.task_state.clone()),
            catalog,
            remote_cursors,
            enqueuer: Arc::clone(&enqueuer),
            config: config.scan.clone(),
        };
        let scan_service = Arc::new(CatalogScanService::new(context.clone()));

        let mut table_scans = TableScanService::new(
            Arc::clone(&store),
            context.task_states.clone(),
            Arc::clone(&enqueuer),
            config.scan.prefix_scan_take_count,
        );
        if self.default_drivers {
            table_scans.register(Arc::new(TableCopyDriver::new(Arc::clone(&store))))?;
        }
        for driver in self.table_scan_drivers {
            table_scans.register(driver)?;
        }
        let table_scans = Arc::new(table_scans);

        let dispatcher = MessageDispatcher::builder(Arc::clone(&enqueuer))
            .register::<CatalogIndexScanMessage>(Arc::new(CatalogIndexScanProcessor::new(
                context.clone(),
            )))
            .register::<CatalogPageScanMessage>(Arc::new(CatalogPageScanProcessor::new(
                context.clone(),
            )))
            .register_batch::<CatalogLeafScanMessage>(Arc::new(CatalogLeafScanProcessor::new(
                context.clone(),
            )))
            .register::<AggregateBucketMessage>(Arc::new(AggregateBucketProcessor::new(context)))
            .register::<TableScanMessage>(Arc::new(TableScanStepProcessor::new(Arc::clone(
                &table_scans,
            ))))
            .build();

        let mut timers: Vec<Arc<dyn Timer>> = vec![Arc::new(CatalogScanUpdateTimer::new(
            Arc::clone(&scan_service),
            std::time::Duration::from_secs(config.timers.catalog_scan_update_frequency_secs),
            config.timers.auto_start_catalog_scan_update,
        ))];
        timers.extend(self.timers);
        let timer_leases = AutoRenewingLeaseService::new(
            Arc::clone(&leases),
            config.lease.renew_interval(),
            self.shutdown.clone(),
        );
        let timers = Arc::new(TimerExecutionService::new(
            timers,
            Arc::clone(&store),
            config.tables.timers.clone(),
            timer_leases,
            config.timers.clone(),
        )?);

        Ok(InsightsServices {
            config,
            store,
            queue,
            enqueuer,
            leases,
            scan_service,
            table_scans,
            dispatcher: Arc::new(dispatcher),
            timers,
            shutdown: self.shutdown,
        })
    }
}

fn shared_http_client(
    slot: &mut Option<Arc<HttpCatalogClient>>,
    config: &InsightsConfig,
) -> Result<Arc<HttpCatalogClient>> {
    if let Some(client) = slot {
        return Ok(Arc::clone(client));
    }
    let client = Arc::new(HttpCatalogClient::new(&config.catalog)?);
    *slot = Some(Arc::clone(&client));
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{CatalogScanDriverType, ScanId};

    fn services() -> InsightsServices {
        let mut config = InsightsConfig::default();
        config.queue.disable_message_delay = true;
        InsightsServices::builder(config)
            .build()
            .expect("services build")
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_immediately() {
        let services = services();
        services.initialize().await.expect("initialize");
        services
            .queue()
            .enqueue(QueueKind::Expand, "not json".into(), std::time::Duration::ZERO)
            .await
            .expect("enqueue");

        assert!(services.process_next(QueueKind::Expand).await.expect("process"));
        assert!(!services.process_next(QueueKind::Expand).await.expect("idle"));
        let dead = services
            .queue()
            .dead_letters(QueueKind::Expand)
            .await
            .expect("dead letters");
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_until_budget_is_spent() {
        let services = services();
        services.initialize().await.expect("initialize");

        // A pending bucket whose index scan is gone fails on every delivery.
        let scan_id = ScanId::new();
        let suffix = scan_id.storage_suffix();
        let task_states = &services.scan_service().context().task_states;
        task_states.initialize(&suffix).await.expect("task table");
        task_states
            .add(&suffix, &scan_id.to_string(), &["3".to_owned()])
            .await
            .expect("task state");
        services
            .enqueuer()
            .enqueue(&[AggregateBucketMessage {
                driver_type: CatalogScanDriverType::BuildVersionSet,
                scan_id,
                storage_suffix: suffix,
                bucket: 3,
            }])
            .await
            .expect("enqueue");

        let processed = services.process_until_idle(100).await.expect("drain");
        assert_eq!(processed, services.config().retry.max_attempts as usize);
        let dead = services
            .queue()
            .dead_letters(QueueKind::Work)
            .await
            .expect("dead letters");
        assert_eq!(dead.len(), 1);
    }
}
