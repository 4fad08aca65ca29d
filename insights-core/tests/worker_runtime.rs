mod common;

use std::{sync::Arc, time::Duration};

use common::{Harness, at, leaf};
use insights_core::{
    catalog::CatalogLeafType,
    runtime::WorkerRuntime,
    scan::{CatalogIndexScanResult, CatalogScanDriverType},
    timer::CatalogScanUpdateTimer,
};

const DRIVER: CatalogScanDriverType = CatalogScanDriverType::CatalogDataToCsv;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pools_drive_scan_to_completion() {
    let mut config = common::test_config();
    config.queue.idle_poll_ms = 10;
    let harness = Harness::with_config(config, CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(0)).await;
    harness.catalog.push(leaf("Foo", "1.0.0", 1, CatalogLeafType::PackageDetails));

    let runtime = WorkerRuntime::new(Arc::clone(&harness.services));
    runtime.start(false).await.expect("start");

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, Some(at(5)))
        .await
        .expect("update");
    assert!(result.is_new_started());

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        while harness.cursor(DRIVER).await != at(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    runtime.shutdown().await.expect("shutdown");

    assert!(completed.is_ok(), "scan did not complete in time");
    assert_eq!(harness.driver.seen().len(), 1);
    assert!(harness.services.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn catalog_scan_update_timer_starts_scans_up_to_dependency() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(0)).await;
    harness.remote.set(at(5));
    harness.catalog.push(leaf("Foo", "1.0.0", 1, CatalogLeafType::PackageDetails));

    let ran = harness
        .services
        .timers()
        .execute_now(CatalogScanUpdateTimer::NAME)
        .await
        .expect("execute timer");
    assert!(ran);
    harness.run_to_idle().await;

    assert_eq!(harness.cursor(DRIVER).await, at(5));
    assert_eq!(harness.driver.seen().len(), 1);

    let states = harness.services.timers().get_state().await.expect("timer state");
    let timer = states
        .iter()
        .find(|state| state.name == CatalogScanUpdateTimer::NAME)
        .expect("timer registered");
    assert!(timer.last_executed.is_some());
    assert!(!timer.is_running);
}
