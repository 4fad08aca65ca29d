//! Message processors that drive catalog scans.

mod aggregate;
mod index;
mod leaf;
mod page;

pub use aggregate::AggregateBucketProcessor;
pub use index::CatalogIndexScanProcessor;
pub use leaf::CatalogLeafScanProcessor;
pub use page::CatalogPageScanProcessor;
