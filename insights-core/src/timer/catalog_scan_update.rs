use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::info;

use super::Timer;
use crate::{error::Result, scan::CatalogScanService};

/// Starts an update scan for every registered driver that has catalog to
/// catch up on.
#[derive(Clone, Debug)]
pub struct CatalogScanUpdateTimer {
    service: Arc<CatalogScanService>,
    frequency: Duration,
    auto_start: bool,
}

impl CatalogScanUpdateTimer {
    pub const NAME: &'static str = "CatalogScanUpdate";

    pub fn new(service: Arc<CatalogScanService>, frequency: Duration, auto_start: bool) -> Self {
        Self {
            service,
            frequency,
            auto_start,
        }
    }
}

#[async_trait]
impl Timer for CatalogScanUpdateTimer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn frequency(&self) -> Duration {
        self.frequency
    }

    fn auto_start(&self) -> bool {
        self.auto_start
    }

    // Runs after timers that feed dependency cursors.
    fn order(&self) -> i32 {
        10
    }

    async fn execute(&self) -> Result<bool> {
        let results = self.service.update_all(None).await;
        let started: Vec<String> = results
            .iter()
            .filter(|(_, result)| result.as_ref().is_ok_and(|r| r.is_new_started()))
            .map(|(driver, _)| driver.to_string())
            .collect();
        let failed = results.values().filter(|result| result.is_err()).count();
        info!(started = ?started, failed, "catalog scan update timer ran");
        Ok(!started.is_empty())
    }

    async fn is_running(&self) -> Result<bool> {
        for state in self.service.get_all_states().await? {
            if state.is_running() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
