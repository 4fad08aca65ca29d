use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::InsightsServices;
use crate::{error::Result, queue::QueueKind};

/// Owns the background tasks of a worker process: one pool of consumers per
/// queue plus the timer tick loop.
pub struct WorkerRuntime {
    services: Arc<InsightsServices>,
    shutdown: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .ok();
        f.debug_struct("WorkerRuntime")
            .field("services", &self.services)
            .field("worker_handles", &handle_count)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerRuntime {
    pub fn new(services: Arc<InsightsServices>) -> Self {
        let shutdown = services.shutdown_token().clone();
        Self {
            services,
            shutdown,
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Arc<InsightsServices> {
        &self.services
    }

    /// Spawns the worker pools and, unless `with_timers` is false, the
    /// timer loop.
    pub async fn start(&self, with_timers: bool) -> Result<()> {
        let queue_config = &self.services.config().queue;
        tracing::info!(
            expand_workers = queue_config.expand_workers,
            work_workers = queue_config.work_workers,
            with_timers,
            "starting worker runtime"
        );

        self.spawn_worker_pool(QueueKind::Expand, queue_config.expand_workers)
            .await;
        self.spawn_worker_pool(QueueKind::Work, queue_config.work_workers)
            .await;
        if with_timers {
            self.spawn_timer_loop().await;
        }
        Ok(())
    }

    async fn spawn_worker_pool(&self, kind: QueueKind, parallelism: usize) {
        let worker_group = format!("{}-{}", kind, std::process::id());
        let idle_poll = self.services.config().queue.idle_poll();

        let mut handles = self.worker_handles.lock().await;
        for i in 0..parallelism {
            let worker_id = format!("{}-w{}", worker_group, i);
            let services = Arc::clone(&self.services);
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        tracing::info!("Worker {} shutting down", worker_id);
                        break;
                    }

                    let idle = match services.process_next(kind).await {
                        Ok(true) => false,
                        Ok(false) => true,
                        Err(err) => {
                            tracing::warn!(
                                worker = %worker_id,
                                queue = %kind,
                                error = %err,
                                "queue operation failed"
                            );
                            true
                        }
                    };

                    if idle {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(idle_poll) => {}
                        }
                    }
                }
            }));
        }
    }

    async fn spawn_timer_loop(&self) {
        let services = Arc::clone(&self.services);
        let shutdown = self.shutdown.clone();
        let tick = services.config().timers.tick_interval();

        let handle = tokio::spawn(async move {
            loop {
                match services.timers().execute().await {
                    Ok(true) => tracing::debug!("timer tick ran at least one timer"),
                    Ok(false) => {}
                    Err(err) => tracing::warn!(error = %err, "timer tick failed"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Timer loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown of worker runtime");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => tracing::warn!("Worker task timed out during shutdown"),
            }
        }

        tracing::info!("Worker runtime shutdown complete");
        Ok(())
    }
}
