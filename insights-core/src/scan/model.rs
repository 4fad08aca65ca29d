use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    catalog::{CatalogLeafItem, CatalogLeafType},
    error::{InsightsError, Result},
    storage::TableRow,
};

/// Earliest commit in the nuget.org catalog.
pub const NUGET_ORG_MIN: DateTime<Utc> =
    DateTime::from_timestamp_nanos(1_422_771_765_848_849_500);

/// First commit after which deleted packages are reflected in the catalog.
pub const NUGET_ORG_MIN_DELETED: DateTime<Utc> =
    DateTime::from_timestamp_nanos(1_446_027_746_468_628_200);

/// Every kind of catalog scan the orchestrator knows how to run.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum CatalogScanDriverType {
    BuildVersionSet,
    LoadLatestPackageLeaf,
    LoadPackageArchive,
    PackageArchiveToCsv,
    PackageAssetToCsv,
    CatalogDataToCsv,
}

/// Upper bound a scan's `max` must never exceed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScanDependency {
    /// The remote flat container cursor: packages are downloadable up to it.
    FlatContainer,
    /// Another driver's cursor.
    Driver(CatalogScanDriverType),
}

impl fmt::Display for ScanDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDependency::FlatContainer => f.write_str("FlatContainer"),
            ScanDependency::Driver(driver) => write!(f, "{}", driver.cursor_name()),
        }
    }
}

impl CatalogScanDriverType {
    pub const ALL: [CatalogScanDriverType; 6] = [
        CatalogScanDriverType::BuildVersionSet,
        CatalogScanDriverType::LoadLatestPackageLeaf,
        CatalogScanDriverType::LoadPackageArchive,
        CatalogScanDriverType::PackageArchiveToCsv,
        CatalogScanDriverType::PackageAssetToCsv,
        CatalogScanDriverType::CatalogDataToCsv,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CatalogScanDriverType::BuildVersionSet => "BuildVersionSet",
            CatalogScanDriverType::LoadLatestPackageLeaf => "LoadLatestPackageLeaf",
            CatalogScanDriverType::LoadPackageArchive => "LoadPackageArchive",
            CatalogScanDriverType::PackageArchiveToCsv => "PackageArchiveToCsv",
            CatalogScanDriverType::PackageAssetToCsv => "PackageAssetToCsv",
            CatalogScanDriverType::CatalogDataToCsv => "CatalogDataToCsv",
        }
    }

    pub fn cursor_name(self) -> String {
        format!("CatalogScan-{}", self.as_str())
    }

    /// Where a scan of this type starts when its cursor has never been set.
    pub fn default_min(self) -> DateTime<Utc> {
        match self {
            CatalogScanDriverType::CatalogDataToCsv => NUGET_ORG_MIN,
            _ => NUGET_ORG_MIN_DELETED,
        }
    }

    pub fn dependencies(self) -> Vec<ScanDependency> {
        match self {
            CatalogScanDriverType::PackageArchiveToCsv
            | CatalogScanDriverType::PackageAssetToCsv => vec![ScanDependency::Driver(
                CatalogScanDriverType::LoadPackageArchive,
            )],
            _ => vec![ScanDependency::FlatContainer],
        }
    }
}

impl fmt::Display for CatalogScanDriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogScanDriverType {
    type Err = InsightsError;

    fn from_str(value: &str) -> Result<Self> {
        CatalogScanDriverType::ALL
            .into_iter()
            .find(|driver| driver.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| {
                InsightsError::InvalidArgument(format!("unknown driver type '{value}'"))
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub Uuid);

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanId {
    /// Time-ordered so row keys sort oldest first.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Suffix appended to per-scan table names.
    pub fn storage_suffix(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ScanId {
    type Err = InsightsError;

    fn from_str(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(ScanId)
            .map_err(|err| InsightsError::InvalidArgument(format!("bad scan id '{value}': {err}")))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CatalogScanKind {
    /// Walks the catalog from the cursor and advances it on completion.
    Update,
    /// Replays leaves chosen by the driver; never touches the cursor.
    Reprocess,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CatalogIndexScanState {
    Created,
    Expanding,
    WaitingForPages,
    Enqueuing,
    Working,
    StartingAggregate,
    Aggregating,
    Finalizing,
    Complete,
}

impl CatalogIndexScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CatalogIndexScanState::Complete)
    }
}

/// How an index scan fans out, chosen by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CatalogIndexScanResult {
    /// Page scans enqueue one message per leaf.
    Expand,
    /// Page scans write every leaf record; the index scan enqueues them.
    ExpandAllLeaves,
    /// Page scans keep only the newest leaf per package version.
    ExpandLatestLeaves,
    /// The driver expands on its own.
    CustomExpand,
}

/// How a page scan fans out, chosen by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CatalogPageScanResult {
    Expand,
    /// Like `Expand`, but only the newest leaf per package version on the page
    /// is kept.
    ExpandRemoveDuplicates,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogIndexScan {
    pub driver_type: CatalogScanDriverType,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    pub kind: CatalogScanKind,
    pub cursor_name: String,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub state: CatalogIndexScanState,
    #[serde(default)]
    pub result: Option<CatalogIndexScanResult>,
    /// Opaque driver-specific parameters.
    #[serde(default)]
    pub parameters: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

impl CatalogIndexScan {
    pub fn new(
        driver_type: CatalogScanDriverType,
        kind: CatalogScanKind,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Self {
        let scan_id = ScanId::new();
        Self {
            driver_type,
            storage_suffix: scan_id.storage_suffix(),
            scan_id,
            kind,
            cursor_name: driver_type.cursor_name(),
            min,
            max,
            state: CatalogIndexScanState::Created,
            result: None,
            parameters: None,
            created: Utc::now(),
            started: None,
            completed: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Prefix shared by the partition keys of every leaf scan of this scan.
    pub fn leaf_partition_prefix(&self) -> String {
        format!("{}-", self.scan_id)
    }
}

impl TableRow for CatalogIndexScan {
    fn partition_key(&self) -> String {
        self.driver_type.as_str().to_owned()
    }

    fn row_key(&self) -> String {
        self.scan_id.to_string()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CatalogPageScanMode {
    Expand,
    WriteAllLeaves,
    WriteLatestLeaves,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CatalogPageScanState {
    Created,
    Enqueuing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPageScan {
    pub scan_id: ScanId,
    pub page_id: String,
    pub storage_suffix: String,
    pub driver_type: CatalogScanDriverType,
    pub mode: CatalogPageScanMode,
    pub state: CatalogPageScanState,
    pub url: String,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub rank: usize,
    #[serde(default)]
    pub parameters: Option<String>,
}

impl CatalogPageScan {
    pub fn page_id_for_rank(rank: usize) -> String {
        format!("P{rank:010}")
    }

    pub fn leaf_partition_key(&self) -> String {
        leaf_partition_key(self.scan_id, &self.page_id)
    }
}

impl TableRow for CatalogPageScan {
    fn partition_key(&self) -> String {
        self.scan_id.to_string()
    }

    fn row_key(&self) -> String {
        self.page_id.clone()
    }
}

pub fn leaf_partition_key(scan_id: ScanId, page_id: &str) -> String {
    format!("{scan_id}-{page_id}")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogLeafScan {
    pub scan_id: ScanId,
    pub page_id: String,
    pub leaf_id: String,
    pub storage_suffix: String,
    pub driver_type: CatalogScanDriverType,
    pub url: String,
    pub page_url: String,
    pub leaf_type: CatalogLeafType,
    pub package_id: String,
    pub package_version: String,
    pub commit_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: Option<String>,
}

impl CatalogLeafScan {
    /// Leaf scan for the `index`-th leaf of a page.
    pub fn for_page_leaf(page: &CatalogPageScan, index: usize, leaf: &CatalogLeafItem) -> Self {
        Self::from_leaf(
            page,
            page.page_id.clone(),
            format!("L{index:010}"),
            leaf,
        )
    }

    /// Leaf scan keyed by package identity, so newer commits of the same
    /// package version land on the same row.
    pub fn for_latest_leaf(page: &CatalogPageScan, leaf: &CatalogLeafItem) -> Self {
        Self::from_leaf(
            page,
            leaf.package_id.to_lowercase(),
            normalize_version(&leaf.package_version),
            leaf,
        )
    }

    fn from_leaf(
        page: &CatalogPageScan,
        page_id: String,
        leaf_id: String,
        leaf: &CatalogLeafItem,
    ) -> Self {
        Self {
            scan_id: page.scan_id,
            page_id,
            leaf_id,
            storage_suffix: page.storage_suffix.clone(),
            driver_type: page.driver_type,
            url: leaf.url.clone(),
            page_url: page.url.clone(),
            leaf_type: leaf.leaf_type,
            package_id: leaf.package_id.clone(),
            package_version: leaf.package_version.clone(),
            commit_timestamp: leaf.commit_timestamp,
            commit_id: leaf.commit_id.clone(),
            attempt_count: 0,
            next_attempt: None,
            parameters: page.parameters.clone(),
        }
    }

    pub fn to_leaf_item(&self) -> CatalogLeafItem {
        CatalogLeafItem {
            url: self.url.clone(),
            leaf_type: self.leaf_type,
            commit_timestamp: self.commit_timestamp,
            commit_id: self.commit_id.clone(),
            package_id: self.package_id.clone(),
            package_version: self.package_version.clone(),
        }
    }
}

impl TableRow for CatalogLeafScan {
    fn partition_key(&self) -> String {
        leaf_partition_key(self.scan_id, &self.page_id)
    }

    fn row_key(&self) -> String {
        self.leaf_id.clone()
    }
}

/// Lowercase with build metadata removed, so `1.0.0+abc` and `1.0.0+ABC`
/// identify the same package.
pub fn normalize_version(version: &str) -> String {
    version
        .split_once('+')
        .map_or(version, |(release, _)| release)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_type_parses_and_names_cursors() {
        let driver: CatalogScanDriverType = "loadlatestpackageleaf".parse().expect("parse");
        assert_eq!(driver, CatalogScanDriverType::LoadLatestPackageLeaf);
        assert_eq!(driver.cursor_name(), "CatalogScan-LoadLatestPackageLeaf");
        assert!("Nope".parse::<CatalogScanDriverType>().is_err());
    }

    #[test]
    fn csv_drivers_depend_on_archive_loading() {
        assert_eq!(
            CatalogScanDriverType::PackageAssetToCsv.dependencies(),
            vec![ScanDependency::Driver(CatalogScanDriverType::LoadPackageArchive)]
        );
        assert_eq!(
            CatalogScanDriverType::CatalogDataToCsv.dependencies(),
            vec![ScanDependency::FlatContainer]
        );
        assert!(
            CatalogScanDriverType::CatalogDataToCsv.default_min()
                < CatalogScanDriverType::LoadPackageArchive.default_min()
        );
    }

    #[test]
    fn versions_normalize_without_build_metadata() {
        assert_eq!(normalize_version("1.0.0-Beta+Sha.ABC"), "1.0.0-beta");
        assert_eq!(normalize_version("2.0.0"), "2.0.0");
    }
}
