mod common;

use std::sync::Arc;

use common::{Harness, at, leaf};
use insights_core::{
    catalog::CatalogLeafType,
    cursor::CURSOR_MIN,
    drivers::{LatestLeafDriver, VersionSetDriver},
    scan::{
        CatalogIndexScanResult, CatalogIndexScanState, CatalogScanDriver, CatalogScanDriverType,
        CatalogScanKind, CatalogScanUpdate, ScanDependency,
    },
};

const DRIVER: CatalogScanDriverType = CatalogScanDriverType::CatalogDataToCsv;

#[tokio::test]
async fn update_scan_processes_window_and_advances_cursor() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(0)).await;
    harness.catalog.push(leaf("Foo", "1.0.0", 1, CatalogLeafType::PackageDetails));
    harness.catalog.push(leaf("Bar", "2.0.0", 7, CatalogLeafType::PackageDetails));

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, Some(at(5)))
        .await
        .expect("update");
    let scan = match result {
        CatalogScanUpdate::NewStarted(scan) => scan,
        other => panic!("expected a new scan, got {other:?}"),
    };
    assert_eq!(scan.min, at(0));
    assert_eq!(scan.max, at(5));
    assert_eq!(scan.kind, CatalogScanKind::Update);

    harness.run_to_idle().await;

    let seen = harness.driver.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].package_id, "Foo");
    assert_eq!(seen[0].package_version, "1.0.0");
    assert_eq!(harness.cursor(DRIVER).await, at(5));
    assert_eq!(harness.driver.finalized().len(), 1);

    let state = harness
        .services
        .scan_service()
        .get_state(DRIVER)
        .await
        .expect("state");
    assert!(!state.is_running());
    assert_eq!(state.latest_scans[0].state, CatalogIndexScanState::Complete);
    assert!(state.latest_scans[0].completed.is_some());
}

#[tokio::test]
async fn write_all_leaves_mode_enqueues_through_prefix_scan() {
    let mut config = common::test_config();
    config.scan.prefix_scan_take_count = 2;
    let harness = Harness::with_config(config, CatalogIndexScanResult::ExpandAllLeaves).await;
    harness.set_cursor(DRIVER, at(0)).await;
    for (i, id) in ["A", "B", "C", "D", "E"].into_iter().enumerate() {
        harness
            .catalog
            .push(leaf(id, "1.0.0", i as u32 + 1, CatalogLeafType::PackageDetails));
    }

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, Some(at(10)))
        .await
        .expect("update");
    assert!(result.is_new_started());

    harness.run_to_idle().await;

    let mut ids: Vec<String> = harness
        .driver
        .seen()
        .into_iter()
        .map(|leaf| leaf.package_id)
        .collect();
    ids.sort();
    assert_eq!(ids, ["A", "B", "C", "D", "E"]);
    assert_eq!(harness.cursor(DRIVER).await, at(10));
}

#[tokio::test]
async fn successive_scans_cover_adjacent_windows() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(0)).await;
    harness.catalog.push(leaf("Foo", "1.0.0", 3, CatalogLeafType::PackageDetails));
    harness.catalog.push(leaf("Foo", "2.0.0", 8, CatalogLeafType::PackageDetails));

    let service = harness.services.scan_service();
    assert!(service.update(DRIVER, Some(at(5))).await.expect("first").is_new_started());
    harness.run_to_idle().await;
    assert!(service.update(DRIVER, Some(at(10))).await.expect("second").is_new_started());
    harness.run_to_idle().await;

    let versions: Vec<String> = harness
        .driver
        .seen()
        .into_iter()
        .map(|leaf| leaf.package_version)
        .collect();
    assert_eq!(versions, ["1.0.0", "2.0.0"]);
    assert_eq!(harness.cursor(DRIVER).await, at(10));

    let windows: Vec<_> = harness
        .driver
        .finalized()
        .into_iter()
        .map(|scan| (scan.min, scan.max))
        .collect();
    assert_eq!(windows, [(at(0), at(5)), (at(5), at(10))]);
}

#[tokio::test]
async fn update_is_blocked_while_dependency_cursor_is_unset() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.remote.set(CURSOR_MIN);

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, None)
        .await
        .expect("update");
    assert!(matches!(
        result,
        CatalogScanUpdate::BlockedByDependency {
            dependency: ScanDependency::FlatContainer
        }
    ));
}

#[tokio::test]
async fn update_past_dependency_is_blocked() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.remote.set(at(5));

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, Some(at(6)))
        .await
        .expect("update");
    assert!(matches!(result, CatalogScanUpdate::BlockedByDependency { .. }));
}

#[tokio::test]
async fn update_reports_min_after_max_and_caught_up() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(10)).await;
    let service = harness.services.scan_service();

    let result = service.update(DRIVER, Some(at(5))).await.expect("update");
    assert!(matches!(
        result,
        CatalogScanUpdate::MinAfterMax { min, max } if min == at(10) && max == at(5)
    ));

    let result = service.update(DRIVER, Some(at(10))).await.expect("update");
    assert!(matches!(result, CatalogScanUpdate::FullyCaughtUpWithMax));

    harness.remote.set(at(10));
    let result = service.update(DRIVER, None).await.expect("update");
    assert!(matches!(
        result,
        CatalogScanUpdate::FullyCaughtUpWithDependency {
            dependency: ScanDependency::FlatContainer
        }
    ));
}

#[tokio::test]
async fn second_update_sees_running_scan() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.set_cursor(DRIVER, at(0)).await;
    let service = harness.services.scan_service();

    let first = service.update(DRIVER, Some(at(5))).await.expect("first");
    let started = first.scan().expect("scan").scan_id;
    let second = service.update(DRIVER, Some(at(5))).await.expect("second");
    match second {
        CatalogScanUpdate::AlreadyRunning(scan) => assert_eq!(scan.scan_id, started),
        other => panic!("expected the running scan, got {other:?}"),
    }
    assert!(service.is_running(DRIVER).await.expect("is running"));

    harness.run_to_idle().await;
    assert!(!service.is_running(DRIVER).await.expect("is running"));
}

#[tokio::test]
async fn disabled_driver_never_starts() {
    let mut config = common::test_config();
    config.scan.disabled_drivers.push(DRIVER);
    let harness = Harness::with_config(config, CatalogIndexScanResult::Expand).await;

    let result = harness
        .services
        .scan_service()
        .update(DRIVER, Some(at(5)))
        .await
        .expect("update");
    assert!(matches!(result, CatalogScanUpdate::Disabled));
}

#[tokio::test]
async fn version_set_aggregates_staged_leaves() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.catalog.push(leaf("Foo", "1.0.0", 1, CatalogLeafType::PackageDetails));
    harness.catalog.push(leaf("Foo", "2.0.0", 2, CatalogLeafType::PackageDetails));
    harness.catalog.push(leaf("Foo", "2.0.0", 3, CatalogLeafType::PackageDelete));
    harness.catalog.push(leaf("Bar", "1.0.0+build", 4, CatalogLeafType::PackageDetails));

    let driver_type = CatalogScanDriverType::BuildVersionSet;
    let result = harness
        .services
        .scan_service()
        .update(driver_type, Some(at(5)))
        .await
        .expect("update");
    assert!(result.is_new_started());
    harness.run_to_idle().await;

    let versions = VersionSetDriver::new(
        Arc::clone(&harness.store),
        &harness.services.config().tables,
    );
    assert!(versions.did_version_ever_exist("foo", "1.0.0").await.expect("lookup"));
    assert!(versions.did_version_ever_exist("FOO", "2.0.0").await.expect("lookup"));
    assert!(versions.did_version_ever_exist("bar", "1.0.0").await.expect("lookup"));

    let available: Vec<String> = versions
        .get_available_versions("foo")
        .await
        .expect("available")
        .into_iter()
        .map(|entry| entry.lower_version)
        .collect();
    assert_eq!(available, ["1.0.0"]);
    assert_eq!(harness.cursor(driver_type).await, at(5));
}

#[tokio::test]
async fn latest_leaf_scan_keeps_newest_commit_and_can_reprocess() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    harness.catalog.push(leaf("Foo", "1.0.0", 1, CatalogLeafType::PackageDetails));
    harness.catalog.push(leaf("Foo", "1.0.0", 4, CatalogLeafType::PackageDelete));
    harness.catalog.push(leaf("Baz", "3.0.0", 2, CatalogLeafType::PackageDetails));

    let driver_type = CatalogScanDriverType::LoadLatestPackageLeaf;
    let service = harness.services.scan_service();
    assert!(service.update(driver_type, Some(at(5))).await.expect("update").is_new_started());
    harness.run_to_idle().await;

    let latest = LatestLeafDriver::new(
        Arc::clone(&harness.store),
        harness.services.config().tables.latest_package_leaves.clone(),
    );
    let foo = latest.get("Foo", "1.0.0").await.expect("get").expect("stored");
    assert_eq!(foo.leaf_type, CatalogLeafType::PackageDelete);
    assert_eq!(foo.commit_timestamp, at(4));

    let result = service.reprocess(driver_type).await.expect("reprocess");
    let scan = result.scan().expect("scan").clone();
    assert_eq!(scan.kind, CatalogScanKind::Reprocess);
    assert_eq!(scan.min, at(5));
    assert_eq!(scan.max, at(5));
    harness.run_to_idle().await;

    let state = service.get_state(driver_type).await.expect("state");
    assert_eq!(state.latest_scans[0].scan_id, scan.scan_id);
    assert_eq!(state.latest_scans[0].state, CatalogIndexScanState::Complete);
    assert_eq!(harness.cursor(driver_type).await, at(5));
    let foo = latest.get("Foo", "1.0.0").await.expect("get").expect("stored");
    assert_eq!(foo.commit_timestamp, at(4));
}

#[tokio::test]
async fn reprocess_requires_capability() {
    let harness = Harness::new(CatalogIndexScanResult::Expand).await;
    let err = harness
        .services
        .scan_service()
        .reprocess(DRIVER)
        .await
        .expect_err("recording driver cannot reprocess");
    assert!(matches!(err, insights_core::InsightsError::InvalidArgument(_)));
}

#[tokio::test]
async fn update_all_keeps_going_past_a_failing_driver() {
    let archive_csv: Arc<dyn CatalogScanDriver> = Arc::new(common::RecordingDriver::new(
        CatalogScanDriverType::PackageArchiveToCsv,
        CatalogIndexScanResult::Expand,
    ));
    let harness = Harness::with_drivers(
        common::test_config(),
        CatalogIndexScanResult::Expand,
        vec![archive_csv],
    )
    .await;
    harness
        .set_cursor(CatalogScanDriverType::LoadPackageArchive, at(10))
        .await;
    harness
        .set_cursor(CatalogScanDriverType::PackageArchiveToCsv, at(0))
        .await;
    harness.remote.set_failing(true);

    let results = harness.services.scan_service().update_all(None).await;

    // Sorts before the archive driver, so it fails first.
    let version_set = results
        .get(&CatalogScanDriverType::BuildVersionSet)
        .expect("version set result");
    assert!(matches!(
        version_set,
        Err(insights_core::InsightsError::HttpStatus { status: 503, .. })
    ));
    assert!(results[&DRIVER].is_err());

    let archive = results
        .get(&CatalogScanDriverType::PackageArchiveToCsv)
        .expect("archive result")
        .as_ref()
        .expect("archive driver does not read the remote cursor");
    assert!(archive.is_new_started());
    let scan = archive.scan().expect("scan");
    assert_eq!((scan.min, scan.max), (at(0), at(10)));
}
