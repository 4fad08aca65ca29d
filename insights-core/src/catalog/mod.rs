//! Remote catalog documents and the narrow clients used to fetch them.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod http;

pub use http::HttpCatalogClient;

/// The catalog root: every page with its newest commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogIndex {
    #[serde(rename = "commitTimeStamp", default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: usize,
    pub items: Vec<CatalogPageItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPageItem {
    #[serde(rename = "@id")]
    pub url: String,
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Approximate number of leaves on the page.
    #[serde(default)]
    pub count: usize,
}

impl CatalogIndex {
    /// Pages that may hold commits in `(min, max]`, oldest first.
    ///
    /// A page's timestamp is its newest commit, so every page after `min`
    /// is needed up to and including the first page reaching `max`.
    pub fn pages_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<CatalogPageItem> {
        let mut pages: Vec<&CatalogPageItem> = self
            .items
            .iter()
            .filter(|page| page.commit_timestamp > min)
            .collect();
        pages.sort_by_key(|page| page.commit_timestamp);

        let mut output = Vec::new();
        for page in pages {
            output.push(page.clone());
            if page.commit_timestamp >= max {
                break;
            }
        }
        output
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPage {
    #[serde(rename = "@id", default)]
    pub url: String,
    #[serde(rename = "commitTimeStamp", default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub items: Vec<CatalogLeafItem>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CatalogLeafType {
    #[serde(rename = "nuget:PackageDetails")]
    PackageDetails,
    #[serde(rename = "nuget:PackageDelete")]
    PackageDelete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogLeafItem {
    #[serde(rename = "@id")]
    pub url: String,
    #[serde(rename = "@type")]
    pub leaf_type: CatalogLeafType,
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    #[serde(rename = "commitId", default)]
    pub commit_id: String,
    #[serde(rename = "nuget:id")]
    pub package_id: String,
    #[serde(rename = "nuget:version")]
    pub package_version: String,
}

impl CatalogLeafItem {
    /// Commit order, then package id ignoring case.
    pub fn commit_order(&self, other: &Self) -> Ordering {
        self.commit_timestamp
            .cmp(&other.commit_timestamp)
            .then_with(|| {
                self.package_id
                    .to_lowercase()
                    .cmp(&other.package_id.to_lowercase())
            })
    }
}

impl CatalogPage {
    /// Leaves committed in `(min, max]`, ordered by [`CatalogLeafItem::commit_order`].
    pub fn leaves_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<CatalogLeafItem> {
        let mut leaves: Vec<CatalogLeafItem> = self
            .items
            .iter()
            .filter(|leaf| leaf.commit_timestamp > min && leaf.commit_timestamp <= max)
            .cloned()
            .collect();
        leaves.sort_by(CatalogLeafItem::commit_order);
        leaves
    }
}

/// Reads the remote catalog.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_index(&self) -> Result<CatalogIndex>;

    async fn get_page(&self, url: &str) -> Result<CatalogPage>;
}

/// Reads cursors published by other services (the flat container cursor).
#[async_trait]
pub trait RemoteCursorClient: Send + Sync {
    async fn get_flat_container_cursor(&self) -> Result<DateTime<Utc>>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, sec)
            .single()
            .expect("valid timestamp")
    }

    fn page(url: &str, sec: u32) -> CatalogPageItem {
        CatalogPageItem {
            url: url.into(),
            commit_timestamp: at(sec),
            count: 1,
        }
    }

    #[test]
    fn pages_in_bounds_stops_after_first_page_reaching_max() {
        let index = CatalogIndex {
            commit_timestamp: None,
            count: 4,
            items: vec![page("p3", 30), page("p0", 5), page("p1", 10), page("p2", 20)],
        };

        let urls: Vec<String> = index
            .pages_in_bounds(at(5), at(15))
            .into_iter()
            .map(|p| p.url)
            .collect();
        assert_eq!(urls, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn leaf_json_uses_catalog_property_names() {
        let page: CatalogPage = serde_json::from_str(
            r#"{
                "@id": "https://example/page0.json",
                "items": [
                    {
                        "@id": "https://example/b.json",
                        "@type": "nuget:PackageDelete",
                        "commitTimeStamp": "2020-01-01T00:00:02Z",
                        "commitId": "c2",
                        "nuget:id": "beta",
                        "nuget:version": "1.0.0"
                    },
                    {
                        "@id": "https://example/a.json",
                        "@type": "nuget:PackageDetails",
                        "commitTimeStamp": "2020-01-01T00:00:02Z",
                        "commitId": "c2",
                        "nuget:id": "Alpha",
                        "nuget:version": "2.0.0"
                    },
                    {
                        "@id": "https://example/old.json",
                        "@type": "nuget:PackageDetails",
                        "commitTimeStamp": "2020-01-01T00:00:00Z",
                        "commitId": "c0",
                        "nuget:id": "Old",
                        "nuget:version": "1.0.0"
                    }
                ]
            }"#,
        )
        .expect("parse page");

        let leaves = page.leaves_in_bounds(at(0), at(5));
        let ids: Vec<&str> = leaves.iter().map(|l| l.package_id.as_str()).collect();
        assert_eq!(ids, vec!["Alpha", "beta"]);
        assert_eq!(leaves[1].leaf_type, CatalogLeafType::PackageDelete);
    }
}
