mod common;

use common::Harness;
use insights_core::{
    scan::CatalogIndexScanResult,
    storage::{PrefixScanStep, TableQuery},
    table_scan::{TablePrefixScanStartParameters, TableScanDriverType, TableScanMessage},
};
use serde_json::json;

async fn seeded_harness(take: usize) -> Harness {
    let mut config = common::test_config();
    config.scan.prefix_scan_take_count = take;
    let harness = Harness::with_config(config, CatalogIndexScanResult::Expand).await;
    harness
        .store
        .create_table_if_not_exists("packages")
        .await
        .expect("source table");
    for package in ["pkg-alpha", "pkg-beta", "pkg-bravo", "pkg-gamma", "other"] {
        for version in 0..3 {
            harness
                .store
                .upsert(
                    "packages",
                    package,
                    &format!("{version}.0.0"),
                    json!({"id": package, "version": version}),
                )
                .await
                .expect("seed row");
        }
    }
    harness
}

async fn copied_keys(harness: &Harness, table: &str) -> Vec<(String, String)> {
    harness
        .store
        .query_all(table, &TableQuery::all())
        .await
        .expect("read copy")
        .into_iter()
        .map(|entity| (entity.partition_key, entity.row_key))
        .collect()
}

#[tokio::test]
async fn copy_visits_every_row_under_the_prefix() {
    let harness = seeded_harness(2).await;
    let table_scans = harness.services.table_scans();

    let scan = table_scans
        .start(
            TableScanDriverType::TableCopy,
            "packages",
            "pkg-",
            TablePrefixScanStartParameters {
                segments_per_first_prefix: 1,
                segments_per_subsequent_prefix: 2,
            },
            json!({"destination_table_name": "packagecopy"}),
        )
        .await
        .expect("start copy");
    assert!(table_scans.pending(&scan).await.expect("pending") > 0);
    assert!(!table_scans.complete(&scan).await.expect("not yet complete"));

    let processed = harness.run_to_idle().await;
    assert!(processed > 2, "scan should fan out, ran {processed} steps");

    let keys = copied_keys(&harness, "packagecopy").await;
    assert_eq!(keys.len(), 12);
    assert!(keys.iter().all(|(pk, _)| pk.starts_with("pkg-")));
    let copied = harness
        .store
        .get("packagecopy", "pkg-beta", "2.0.0")
        .await
        .expect("read row")
        .expect("row copied");
    assert_eq!(copied.value, json!({"id": "pkg-beta", "version": 2}));

    assert_eq!(table_scans.pending(&scan).await.expect("pending"), 0);
    assert!(table_scans.complete(&scan).await.expect("complete"));
}

#[tokio::test]
async fn empty_prefix_copies_the_whole_table() {
    let harness = seeded_harness(1_000).await;
    let table_scans = harness.services.table_scans();

    let scan = table_scans
        .start(
            TableScanDriverType::TableCopy,
            "packages",
            "",
            TablePrefixScanStartParameters::default(),
            json!({"destination_table_name": "everything"}),
        )
        .await
        .expect("start copy");
    harness.run_to_idle().await;

    assert_eq!(copied_keys(&harness, "everything").await.len(), 15);
    assert!(table_scans.complete(&scan).await.expect("complete"));
}

#[tokio::test]
async fn start_rejects_bad_driver_parameters() {
    let harness = seeded_harness(10).await;
    let err = harness
        .services
        .table_scans()
        .start(
            TableScanDriverType::TableCopy,
            "packages",
            "pkg-",
            TablePrefixScanStartParameters::default(),
            json!({"destination": "nope"}),
        )
        .await
        .unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn step_arriving_after_completion_is_ignored() {
    let harness = seeded_harness(1_000).await;
    let table_scans = harness.services.table_scans();
    let parameters = json!({"destination_table_name": "late"});
    let scan = table_scans
        .start(
            TableScanDriverType::TableCopy,
            "packages",
            "pkg-",
            TablePrefixScanStartParameters::default(),
            parameters.clone(),
        )
        .await
        .expect("start copy");
    harness.run_to_idle().await;
    assert!(table_scans.complete(&scan).await.expect("complete"));
    harness
        .store
        .delete_table("late")
        .await
        .expect("drop copy");
    harness
        .store
        .create_table_if_not_exists("late")
        .await
        .expect("recreate copy");

    harness
        .services
        .enqueuer()
        .enqueue(&[TableScanMessage {
            driver_type: TableScanDriverType::TableCopy,
            scan_id: scan.scan_id,
            storage_suffix: scan.storage_suffix.clone(),
            task_row_key: "1".to_owned(),
            source_table: "packages".to_owned(),
            step: PrefixScanStep::Expand {
                depth: 0,
                prefix: "pkg-".to_owned(),
                partition_key_after: "pkg-".to_owned(),
            },
            start: TablePrefixScanStartParameters::default(),
            driver_parameters: parameters,
        }])
        .await
        .expect("enqueue duplicate");

    assert_eq!(harness.run_to_idle().await, 1);
    assert!(copied_keys(&harness, "late").await.is_empty());
}
