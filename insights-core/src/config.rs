use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::scan::CatalogScanDriverType;

/// Top-level knobs for the worker.
///
/// Every section carries defaults so a deployment only has to spell out what
/// it changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InsightsConfig {
    /// Remote catalog and cursor endpoints.
    pub catalog: CatalogConfig,
    /// Scan state machine tuning (disabled drivers, retention, polling).
    pub scan: ScanConfig,
    /// Worker pool sizes, visibility timeouts and batching behaviour.
    pub queue: QueueConfig,
    /// Redelivery policy for messages that fail processing.
    pub retry: RetryConfig,
    /// Lease expiry and renewal cadence.
    pub lease: LeaseConfig,
    /// Timer coordinator settings.
    pub timers: TimerConfig,
    /// Physical table names.
    pub tables: TableNames,
    /// Storage backend selection.
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub index_url: String,
    /// Document whose `value` property is the flat container cursor.
    pub flat_container_cursor_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_url: "https://api.nuget.org/v3/catalog0/index.json".into(),
            flat_container_cursor_url:
                "https://api.nuget.org/v3-flatcontainer/cursor.json".into(),
            user_agent: concat!("insights-worker/", env!("CARGO_PKG_VERSION"))
                .into(),
            request_timeout_secs: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Drivers that `update` refuses to start.
    pub disabled_drivers: Vec<CatalogScanDriverType>,
    /// Completed index scans retained per driver.
    pub old_index_scans_to_keep: usize,
    /// Ceiling for the index scan polling delay (seconds).
    pub max_poll_delay_secs: u64,
    /// Page size used by the prefix scanner.
    pub prefix_scan_take_count: usize,
}

impl ScanConfig {
    pub fn is_disabled(&self, driver_type: CatalogScanDriverType) -> bool {
        self.disabled_drivers.contains(&driver_type)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            disabled_drivers: Vec::new(),
            old_index_scans_to_keep: 49,
            max_poll_delay_secs: 60,
            prefix_scan_take_count: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Workers pulling from the expand queue (index and page scans).
    pub expand_workers: usize,
    /// Workers pulling from the work queue (leaf scans and aggregation).
    pub work_workers: usize,
    /// How long a dequeued message stays invisible to other workers.
    pub visibility_timeout_secs: u64,
    /// Sleep between polls when a queue is empty (ms).
    pub idle_poll_ms: u64,
    /// Pack messages into batch envelopes when enqueueing in bulk.
    pub allow_batching: bool,
    /// Minimum message count before batching kicks in.
    pub bulk_enqueue_threshold: usize,
    /// Maximum messages per batch envelope.
    pub max_batch_size: usize,
    /// Force every enqueue delay to zero. Useful for tests and backfills.
    pub disable_message_delay: bool,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            expand_workers: 2,
            work_workers: 8,
            visibility_timeout_secs: 5 * 60,
            idle_poll_ms: 500,
            allow_batching: true,
            bulk_enqueue_threshold: 10,
            max_batch_size: 100,
            disable_message_delay: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Deliveries before a message is moved to the dead-letter area.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so tiny delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay for the given delivery attempt, before jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(30) as i32;
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.backoff_max_ms as f64).max(0.0) as u64
    }

    /// Redelivery delay for the given attempt with jitter applied.
    pub fn backoff_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }

        let upper_cap = self.backoff_max_ms.max(1) as f64;
        let spread = ((base as f64) * f64::from(self.jitter_ratio.max(0.0)))
            .max(self.jitter_min_ms as f64);
        let lower = (base as f64 - spread).max(1.0);
        let upper = (base as f64 + spread).min(upper_cap).max(lower);

        Duration::from_millis(rng.random_range(lower..=upper).round() as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

/// Lease expiry and renewal cadence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long an acquired lease stays valid without renewal (seconds).
    pub duration_secs: u64,
    /// Auto-renewal cadence (ms). Must be shorter than the duration.
    pub renew_interval_ms: u64,
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            renew_interval_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tick cadence for the timer coordinator (ms).
    pub tick_interval_ms: u64,
    /// Lease name serializing timer ticks across workers.
    pub lease_name: String,
    pub catalog_scan_update_frequency_secs: u64,
    /// Whether the catalog scan update timer starts enabled on first sight.
    pub auto_start_catalog_scan_update: bool,
    /// Timers that never run regardless of their stored state.
    pub disabled_timers: Vec<String>,
}

impl TimerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_timers.iter().any(|disabled| disabled == name)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 30_000,
            lease_name: "TimerExecutionService".into(),
            catalog_scan_update_frequency_secs: 6 * 60 * 60,
            auto_start_catalog_scan_update: false,
            disabled_timers: Vec::new(),
        }
    }
}

/// Physical table names. Per-scan tables get the scan's storage suffix
/// appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub cursors: String,
    pub leases: String,
    pub catalog_index_scans: String,
    pub catalog_page_scans: String,
    pub catalog_leaf_scans: String,
    pub task_state: String,
    pub timers: String,
    pub latest_package_leaves: String,
    pub version_set: String,
    pub version_set_staging: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            cursors: "cursors".into(),
            leases: "leases".into(),
            catalog_index_scans: "catalogindexscans".into(),
            catalog_page_scans: "catalogpagescans".into(),
            catalog_leaf_scans: "catalogleafscans".into(),
            task_state: "taskstate".into(),
            timers: "timers".into(),
            latest_package_leaves: "latestpackageleaves".into(),
            version_set: "versionset".into(),
            version_set_staging: "versionsetstaging".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Required when `backend = "postgres"`.
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..RetryConfig::default()
        };

        assert_eq!(retry.base_delay_ms(0), 0);
        assert_eq!(retry.base_delay_ms(1), 1_000);
        assert_eq!(retry.base_delay_ms(2), 2_000);
        assert_eq!(retry.base_delay_ms(3), 4_000);
        assert_eq!(retry.base_delay_ms(4), 5_000);
        assert_eq!(retry.base_delay_ms(40), 5_000);
    }

    #[test]
    fn jittered_backoff_stays_within_cap() {
        let retry = RetryConfig::default();
        let mut rng = rand::rng();
        for attempt in 1..10 {
            let delay = retry.backoff_for(attempt, &mut rng);
            assert!(delay <= retry.backoff_max());
            assert!(delay >= Duration::from_millis(1));
        }
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: InsightsConfig = serde_json::from_str(
            r#"{ "scan": { "disabled_drivers": ["CatalogDataToCsv"] } }"#,
        )
        .expect("parse config");

        assert!(config.scan.is_disabled(CatalogScanDriverType::CatalogDataToCsv));
        assert_eq!(config.scan.old_index_scans_to_keep, 49);
        assert_eq!(config.queue.bulk_enqueue_threshold, 10);
        assert_eq!(config.tables.cursors, "cursors");
    }
}
