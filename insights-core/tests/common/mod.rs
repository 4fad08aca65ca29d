#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use insights_core::{
    Result,
    catalog::{
        CatalogClient, CatalogIndex, CatalogLeafItem, CatalogLeafType, CatalogPage,
        CatalogPageItem, RemoteCursorClient,
    },
    config::InsightsConfig,
    error::InsightsError,
    queue::QueueKind,
    runtime::InsightsServices,
    scan::{
        CatalogIndexScan, CatalogIndexScanResult, CatalogLeafScan, CatalogScanDriver,
        CatalogScanDriverType, DriverResult,
    },
    storage::{InMemoryTableStore, TableStore},
};

pub const PAGE_URL: &str = "https://catalog.test/page0.json";

pub fn at(seconds: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, seconds)
        .single()
        .expect("valid timestamp")
}

pub fn leaf(
    package_id: &str,
    version: &str,
    seconds: u32,
    leaf_type: CatalogLeafType,
) -> CatalogLeafItem {
    CatalogLeafItem {
        url: format!(
            "https://catalog.test/data/{}.{}.{}.json",
            seconds,
            package_id.to_lowercase(),
            version
        ),
        leaf_type,
        commit_timestamp: at(seconds),
        commit_id: format!("commit-{seconds}"),
        package_id: package_id.to_owned(),
        package_version: version.to_owned(),
    }
}

/// A one-page catalog whose contents tests can change between scans.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    leaves: Mutex<Vec<CatalogLeafItem>>,
}

impl FakeCatalog {
    pub fn push(&self, leaf: CatalogLeafItem) {
        self.leaves.lock().expect("catalog lock").push(leaf);
    }

    fn snapshot(&self) -> Vec<CatalogLeafItem> {
        self.leaves.lock().expect("catalog lock").clone()
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn get_index(&self) -> Result<CatalogIndex> {
        let leaves = self.snapshot();
        let newest = leaves.iter().map(|leaf| leaf.commit_timestamp).max();
        Ok(CatalogIndex {
            commit_timestamp: newest,
            count: 1,
            items: newest
                .map(|commit_timestamp| CatalogPageItem {
                    url: PAGE_URL.to_owned(),
                    commit_timestamp,
                    count: leaves.len(),
                })
                .into_iter()
                .collect(),
        })
    }

    async fn get_page(&self, url: &str) -> Result<CatalogPage> {
        if url != PAGE_URL {
            return Err(InsightsError::NotFound(url.to_owned()));
        }
        let leaves = self.snapshot();
        Ok(CatalogPage {
            url: url.to_owned(),
            commit_timestamp: leaves.iter().map(|leaf| leaf.commit_timestamp).max(),
            items: leaves,
        })
    }
}

#[derive(Debug)]
pub struct FakeRemoteCursor {
    value: Mutex<DateTime<Utc>>,
    failing: Mutex<bool>,
}

impl FakeRemoteCursor {
    pub fn new(value: DateTime<Utc>) -> Self {
        Self {
            value: Mutex::new(value),
            failing: Mutex::new(false),
        }
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.value.lock().expect("cursor lock") = value;
    }

    /// Makes every read answer 503 until turned off again.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("failing lock") = failing;
    }
}

#[async_trait]
impl RemoteCursorClient for FakeRemoteCursor {
    async fn get_flat_container_cursor(&self) -> Result<DateTime<Utc>> {
        if *self.failing.lock().expect("failing lock") {
            return Err(InsightsError::HttpStatus {
                status: 503,
                url: "https://flat.test/cursor.json".to_owned(),
            });
        }
        Ok(*self.value.lock().expect("cursor lock"))
    }
}

/// Records every leaf it is handed.
#[derive(Debug)]
pub struct RecordingDriver {
    driver_type: CatalogScanDriverType,
    result: CatalogIndexScanResult,
    seen: Mutex<Vec<CatalogLeafScan>>,
    finalized: Mutex<Vec<CatalogIndexScan>>,
}

impl RecordingDriver {
    pub fn new(driver_type: CatalogScanDriverType, result: CatalogIndexScanResult) -> Self {
        Self {
            driver_type,
            result,
            seen: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<CatalogLeafScan> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn finalized(&self) -> Vec<CatalogIndexScan> {
        self.finalized.lock().expect("finalized lock").clone()
    }
}

#[async_trait]
impl CatalogScanDriver for RecordingDriver {
    fn driver_type(&self) -> CatalogScanDriverType {
        self.driver_type
    }

    async fn process_index(&self, _scan: &CatalogIndexScan) -> Result<CatalogIndexScanResult> {
        Ok(self.result)
    }

    async fn process_leaf(&self, leaf: &CatalogLeafScan) -> Result<DriverResult> {
        self.seen.lock().expect("seen lock").push(leaf.clone());
        Ok(DriverResult::Success)
    }

    async fn finalize(&self, scan: &CatalogIndexScan) -> Result<()> {
        self.finalized.lock().expect("finalized lock").push(scan.clone());
        Ok(())
    }
}

pub struct Harness {
    pub services: Arc<InsightsServices>,
    pub store: Arc<dyn TableStore>,
    pub catalog: Arc<FakeCatalog>,
    pub remote: Arc<FakeRemoteCursor>,
    pub driver: Arc<RecordingDriver>,
}

pub fn test_config() -> InsightsConfig {
    let mut config = InsightsConfig::default();
    config.queue.disable_message_delay = true;
    config
}

impl Harness {
    pub async fn new(result: CatalogIndexScanResult) -> Self {
        Self::with_config(test_config(), result).await
    }

    pub async fn with_config(config: InsightsConfig, result: CatalogIndexScanResult) -> Self {
        Self::with_drivers(config, result, Vec::new()).await
    }

    /// Also registers `extra` next to the recording driver.
    pub async fn with_drivers(
        config: InsightsConfig,
        result: CatalogIndexScanResult,
        extra: Vec<Arc<dyn CatalogScanDriver>>,
    ) -> Self {
        let store: Arc<dyn TableStore> = Arc::new(InMemoryTableStore::new());
        let catalog = Arc::new(FakeCatalog::default());
        let remote = Arc::new(FakeRemoteCursor::new(at(59)));
        let driver = Arc::new(RecordingDriver::new(
            CatalogScanDriverType::CatalogDataToCsv,
            result,
        ));

        let mut builder = InsightsServices::builder(config)
            .with_store(Arc::clone(&store))
            .with_catalog(catalog.clone())
            .with_remote_cursors(remote.clone())
            .with_driver(driver.clone())
            .with_lease_owner("test-worker");
        for extra in extra {
            builder = builder.with_driver(extra);
        }
        let services = builder.build().expect("services build");
        services.initialize().await.expect("services initialize");

        Self {
            services: Arc::new(services),
            store,
            catalog,
            remote,
            driver,
        }
    }

    pub async fn set_cursor(&self, driver_type: CatalogScanDriverType, value: DateTime<Utc>) {
        self.services
            .scan_service()
            .context()
            .cursors
            .set(&driver_type.cursor_name(), value)
            .await
            .expect("set cursor");
    }

    pub async fn cursor(&self, driver_type: CatalogScanDriverType) -> DateTime<Utc> {
        self.services
            .scan_service()
            .context()
            .cursors
            .get(&driver_type.cursor_name())
            .await
            .expect("read cursor")
    }

    /// Drains both queues and asserts nothing was dead-lettered.
    pub async fn run_to_idle(&self) -> usize {
        let processed = self
            .services
            .process_until_idle(10_000)
            .await
            .expect("process until idle");
        assert!(processed < 10_000, "queues never went idle");
        for kind in QueueKind::ALL {
            let dead = self
                .services
                .queue()
                .dead_letters(kind)
                .await
                .expect("dead letters");
            assert!(dead.is_empty(), "unexpected dead letters on {kind}: {dead:?}");
        }
        processed
    }
}
