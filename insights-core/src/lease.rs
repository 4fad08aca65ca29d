//! Distributed mutual exclusion over named resources.
//!
//! A lease is a row whose `acquired_until` lies in the future. Acquisition
//! and renewal are conditional writes (insert or etag-guarded replace), so
//! two contenders can never both succeed. A holder that crashes simply stops
//! renewing and the lease expires on its own.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    error::{InsightsError, Result},
    storage::{ETag, Table, TableRow, TableStore},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub owner: String,
    pub acquired_until: DateTime<Utc>,
}

impl TableRow for LeaseRecord {
    fn partition_key(&self) -> String {
        self.name.clone()
    }

    fn row_key(&self) -> String {
        String::new()
    }
}

/// Proof of holding a named lease until `acquired_until`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub acquired_until: DateTime<Utc>,
    etag: ETag,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.acquired_until <= now
    }
}

#[derive(Clone, Debug)]
pub struct LeaseService {
    table: Table<LeaseRecord>,
    owner: String,
    duration: Duration,
}

impl LeaseService {
    /// `owner` identifies this process in stored lease rows; a fresh one is
    /// generated when `None`.
    pub fn new(
        store: Arc<dyn TableStore>,
        table_name: impl Into<String>,
        duration: Duration,
        owner: Option<String>,
    ) -> Self {
        Self {
            table: Table::new(store, table_name),
            owner: owner.unwrap_or_else(|| {
                format!("{}-{}", std::process::id(), Uuid::now_v7().simple())
            }),
            duration,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await
    }

    pub async fn try_acquire(&self, name: &str) -> Result<Option<Lease>> {
        self.try_acquire_for(name, self.duration).await
    }

    /// Returns `None` when another holder's lease is still valid or when a
    /// concurrent contender won the conditional write.
    pub async fn try_acquire_for(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();
        let record = LeaseRecord {
            name: name.to_owned(),
            owner: self.owner.clone(),
            acquired_until: expiry(now, duration)?,
        };

        let write = match self.table.get(name, "").await? {
            None => self.table.insert(&record).await,
            Some(existing) if existing.row.acquired_until > now => {
                trace!(
                    lease = name,
                    holder = %existing.row.owner,
                    until = %existing.row.acquired_until,
                    "lease held elsewhere"
                );
                return Ok(None);
            }
            Some(existing) => self.table.replace(&record, &existing.etag).await,
        };

        match write {
            Ok(etag) => {
                debug!(lease = name, until = %record.acquired_until, "lease acquired");
                Ok(Some(Lease {
                    name: record.name,
                    owner: record.owner,
                    acquired_until: record.acquired_until,
                    etag,
                }))
            }
            Err(
                InsightsError::Conflict(_)
                | InsightsError::PreconditionFailed(_)
                | InsightsError::NotFound(_),
            ) => {
                trace!(lease = name, "lost lease acquisition race");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Extends the lease by the service duration. Fails with `LeaseLost`
    /// when the row changed underneath the holder.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let record = LeaseRecord {
            name: lease.name.clone(),
            owner: lease.owner.clone(),
            acquired_until: expiry(Utc::now(), self.duration)?,
        };
        match self.table.replace(&record, &lease.etag).await {
            Ok(etag) => Ok(Lease {
                name: record.name,
                owner: record.owner,
                acquired_until: record.acquired_until,
                etag,
            }),
            Err(InsightsError::PreconditionFailed(_) | InsightsError::NotFound(_)) => {
                Err(InsightsError::LeaseLost(lease.name.clone()))
            }
            Err(err) => Err(err),
        }
    }

    /// Gives the lease up early. Returns `false` when it had already been
    /// lost, which is not an error.
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        match self.table.delete(&lease.name, "", Some(&lease.etag)).await {
            Ok(released) => {
                debug!(lease = %lease.name, released, "lease released");
                Ok(released)
            }
            Err(InsightsError::PreconditionFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn expiry(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(duration).map_err(|e| {
        InsightsError::InvalidArgument(format!("lease duration out of range: {e}"))
    })?;
    Ok(now + duration)
}

/// Hands out leases that renew themselves in the background.
#[derive(Clone, Debug)]
pub struct AutoRenewingLeaseService {
    leases: Arc<LeaseService>,
    renew_interval: Duration,
    shutdown: CancellationToken,
}

impl AutoRenewingLeaseService {
    /// Renewal stops when the lease is released or dropped, or when
    /// `shutdown` fires.
    pub fn new(
        leases: Arc<LeaseService>,
        renew_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            leases,
            renew_interval,
            shutdown,
        }
    }

    pub fn leases(&self) -> &Arc<LeaseService> {
        &self.leases
    }

    pub async fn try_acquire(&self, name: &str) -> Result<Option<AutoRenewingLease>> {
        let Some(lease) = self.leases.try_acquire(name).await? else {
            return Ok(None);
        };

        let current = Arc::new(Mutex::new(lease));
        let lost = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();

        let handle = tokio::spawn(renew_loop(
            Arc::clone(&self.leases),
            Arc::clone(&current),
            Arc::clone(&lost),
            cancel.clone(),
            self.renew_interval,
        ));

        Ok(Some(AutoRenewingLease {
            name: name.to_owned(),
            leases: Arc::clone(&self.leases),
            current,
            lost,
            cancel,
            handle: Some(handle),
        }))
    }
}

async fn renew_loop(
    leases: Arc<LeaseService>,
    current: Arc<Mutex<Lease>>,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut guard = current.lock().await;
        match leases.renew(&guard).await {
            Ok(renewed) => {
                trace!(lease = %renewed.name, until = %renewed.acquired_until, "lease renewed");
                *guard = renewed;
            }
            Err(InsightsError::LeaseLost(name)) => {
                warn!(lease = %name, "lease lost while held; stopping renewal");
                lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                // Keep trying until the lease runs out.
                warn!(lease = %guard.name, "lease renew failed: {err}");
            }
        }
    }
}

/// A lease kept alive by a background task until released or dropped.
pub struct AutoRenewingLease {
    name: String,
    leases: Arc<LeaseService>,
    current: Arc<Mutex<Lease>>,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AutoRenewingLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoRenewingLease")
            .field("name", &self.name)
            .field("lost", &self.is_lost())
            .field("renewing", &!self.cancel.is_cancelled())
            .finish()
    }
}

impl AutoRenewingLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set once a renewal discovered that someone else took the lease.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Lease {
        self.current.lock().await.clone()
    }

    /// Stops renewal and deletes the lease row.
    pub async fn release(mut self) -> Result<bool> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            warn!(lease = %self.name, "lease renewal task failed: {err}");
        }
        if self.is_lost() {
            return Ok(false);
        }
        let lease = self.current.lock().await.clone();
        self.leases.release(&lease).await
    }
}

impl Drop for AutoRenewingLease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTableStore;

    async fn service(owner: &str, store: Arc<InMemoryTableStore>) -> LeaseService {
        let service = LeaseService::new(
            store,
            "leases",
            Duration::from_secs(60),
            Some(owner.to_owned()),
        );
        service.initialize().await.expect("initialize");
        service
    }

    #[tokio::test]
    async fn only_one_contender_acquires() {
        let store = Arc::new(InMemoryTableStore::new());
        let a = service("a", store.clone()).await;
        let b = service("b", store.clone()).await;

        let (first, second) = tokio::join!(a.try_acquire("lock"), b.try_acquire("lock"));
        let acquired = [first.expect("a"), second.expect("b")]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let store = Arc::new(InMemoryTableStore::new());
        let a = service("a", store.clone()).await;
        let b = service("b", store.clone()).await;

        let lease = a.try_acquire("lock").await.expect("acquire").expect("held");
        assert!(b.try_acquire("lock").await.expect("contend").is_none());

        assert!(a.release(&lease).await.expect("release"));
        assert!(b.try_acquire("lock").await.expect("reacquire").is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_and_old_holder_loses_it() {
        let store = Arc::new(InMemoryTableStore::new());
        let a = service("a", store.clone()).await;
        let b = service("b", store.clone()).await;

        let stale = a
            .try_acquire_for("lock", Duration::ZERO)
            .await
            .expect("acquire")
            .expect("held");
        let taken = b.try_acquire("lock").await.expect("take over");
        assert!(taken.is_some());

        let err = a.renew(&stale).await.expect_err("stale renew");
        assert!(matches!(err, InsightsError::LeaseLost(_)));
        assert!(!a.release(&stale).await.expect("stale release"));
    }

    #[tokio::test]
    async fn auto_renewing_lease_extends_until_released() {
        let store = Arc::new(InMemoryTableStore::new());
        let leases = Arc::new(service("a", store.clone()).await);
        let auto = AutoRenewingLeaseService::new(
            Arc::clone(&leases),
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        let lease = auto.try_acquire("lock").await.expect("acquire").expect("held");
        let initial = lease.snapshot().await.acquired_until;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lease.snapshot().await.acquired_until > initial);
        assert!(!lease.is_lost());

        assert!(lease.release().await.expect("release"));
        let other = service("b", store).await;
        assert!(other.try_acquire("lock").await.expect("reacquire").is_some());
    }
}
