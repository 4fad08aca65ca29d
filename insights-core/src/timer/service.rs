use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{Timer, TimerEntity};
use crate::{
    config::TimerConfig,
    error::{InsightsError, Result},
    lease::AutoRenewingLeaseService,
    storage::{Table, TableQuery, TableStore},
};

/// What `get_state` reports for one timer.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerState {
    pub name: String,
    pub is_running: bool,
    pub is_enabled_in_config: bool,
    pub is_enabled_in_storage: bool,
    pub last_executed: Option<DateTime<Utc>>,
    pub frequency: Duration,
}

/// Runs due timers. Every tick holds the timer lease, so at most one worker
/// in the fleet is executing timers at a time.
pub struct TimerExecutionService {
    timers: Vec<Arc<dyn Timer>>,
    table: Table<TimerEntity>,
    leases: AutoRenewingLeaseService,
    config: TimerConfig,
}

impl fmt::Debug for TimerExecutionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.timers.iter().map(|timer| timer.name()).collect();
        f.debug_struct("TimerExecutionService")
            .field("timers", &names)
            .field("table", &self.table)
            .field("lease_name", &self.config.lease_name)
            .finish()
    }
}

impl TimerExecutionService {
    pub fn new(
        timers: Vec<Arc<dyn Timer>>,
        store: Arc<dyn TableStore>,
        table_name: impl Into<String>,
        leases: AutoRenewingLeaseService,
        config: TimerConfig,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for timer in &timers {
            if !names.insert(timer.name().to_owned()) {
                return Err(InsightsError::InvalidArgument(format!(
                    "duplicate timer name '{}'",
                    timer.name()
                )));
            }
        }
        Ok(Self {
            timers,
            table: Table::new(store, table_name),
            leases,
            config,
        })
    }

    pub async fn initialize(&self) -> Result<()> {
        self.table.create_if_not_exists().await?;
        for timer in &self.timers {
            timer.initialize().await?;
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Result<&Arc<dyn Timer>> {
        self.timers
            .iter()
            .find(|timer| timer.name() == name)
            .ok_or_else(|| InsightsError::InvalidArgument(format!("unknown timer '{name}'")))
    }

    fn enabled_in_config(&self, timer: &dyn Timer) -> bool {
        timer.is_enabled() && !self.config.is_disabled(timer.name())
    }

    pub async fn set_is_enabled(&self, name: &str, is_enabled: bool) -> Result<()> {
        let timer = self.find(name)?;
        let last_executed = self
            .table
            .get("", timer.name())
            .await?
            .and_then(|stored| stored.row.last_executed);
        self.table
            .upsert(&TimerEntity {
                name: timer.name().to_owned(),
                is_enabled,
                last_executed,
            })
            .await?;
        info!(timer = name, is_enabled, "timer enablement changed");
        Ok(())
    }

    pub async fn get_state(&self) -> Result<Vec<TimerState>> {
        let entities = self.load_entities().await?;
        let mut states = Vec::with_capacity(self.timers.len());
        for timer in &self.timers {
            let entity = entities.get(timer.name());
            states.push(TimerState {
                name: timer.name().to_owned(),
                is_running: timer.is_running().await?,
                is_enabled_in_config: self.enabled_in_config(timer.as_ref()),
                is_enabled_in_storage: entity.map_or(timer.auto_start(), |e| e.is_enabled),
                last_executed: entity.and_then(|e| e.last_executed),
                frequency: timer.frequency(),
            });
        }
        Ok(states)
    }

    /// Runs `name` now regardless of its schedule or stored enablement.
    /// Returns `false` when another worker holds the timer lease.
    pub async fn execute_now(&self, name: &str) -> Result<bool> {
        self.find(name)?;
        let ran = self.execute_at(Some(name), Utc::now()).await?;
        if !ran {
            warn!(
                timer = name,
                lease = %self.config.lease_name,
                "forced timer run skipped; timer lease is held elsewhere"
            );
        }
        Ok(ran)
    }

    /// One tick: runs every due timer. Returns `false` when another worker
    /// holds the timer lease.
    pub async fn execute(&self) -> Result<bool> {
        self.execute_at(None, Utc::now()).await
    }

    async fn load_entities(&self) -> Result<HashMap<String, TimerEntity>> {
        Ok(self
            .table
            .query(&TableQuery::partition(""))
            .await?
            .into_iter()
            .map(|stored| (stored.row.name.clone(), stored.row))
            .collect())
    }

    fn should_run(
        &self,
        timer: &dyn Timer,
        entity: Option<&TimerEntity>,
        forced: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.enabled_in_config(timer) {
            return false;
        }
        let Some(entity) = entity else {
            return timer.auto_start() || forced;
        };
        if forced {
            return true;
        }
        if !entity.is_enabled {
            return false;
        }
        let Some(last_executed) = entity.last_executed else {
            return true;
        };
        let frequency = chrono::Duration::from_std(timer.frequency())
            .unwrap_or(chrono::Duration::MAX);
        now - last_executed >= frequency
    }

    async fn execute_at(&self, forced: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let Some(lease) = self.leases.try_acquire(&self.config.lease_name).await? else {
            debug!(lease = %self.config.lease_name, "timer lease held elsewhere");
            return Ok(false);
        };

        let outcome = self.run_due(forced, now).await;

        if let Err(err) = lease.release().await {
            warn!("failed to release timer lease: {err}");
        }
        outcome.map(|()| true)
    }

    async fn run_due(&self, forced: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let entities = self.load_entities().await?;

        let mut groups: BTreeMap<i32, Vec<(Arc<dyn Timer>, bool)>> = BTreeMap::new();
        for timer in &self.timers {
            let entity = entities.get(timer.name());
            let is_forced = forced == Some(timer.name());

            if entity.is_none() {
                self.table
                    .insert_if_absent(&TimerEntity {
                        name: timer.name().to_owned(),
                        is_enabled: timer.auto_start(),
                        last_executed: None,
                    })
                    .await?;
            }

            if self.should_run(timer.as_ref(), entity, is_forced, now) {
                let is_enabled = entity.map_or(timer.auto_start(), |e| e.is_enabled);
                groups
                    .entry(timer.order())
                    .or_default()
                    .push((Arc::clone(timer), is_enabled));
            }
        }

        for (order, group) in groups {
            debug!(order, timers = group.len(), "running timer group");
            join_all(
                group
                    .into_iter()
                    .map(|(timer, is_enabled)| self.run_one(timer, is_enabled, now)),
            )
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        }
        Ok(())
    }

    async fn run_one(
        &self,
        timer: Arc<dyn Timer>,
        is_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match timer.execute().await {
            Ok(did_work) => debug!(timer = timer.name(), did_work, "timer executed"),
            Err(err) => warn!(timer = timer.name(), "timer failed: {err}"),
        }

        self.table
            .upsert(&TimerEntity {
                name: timer.name().to_owned(),
                is_enabled,
                last_executed: Some(now),
            })
            .await?;
        Ok(())
    }
}
