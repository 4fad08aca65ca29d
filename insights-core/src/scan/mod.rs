//! Catalog scan orchestration: models, storage, the driver contract, the
//! scan service and the message processors that move scans forward.

pub mod context;
pub mod driver;
pub mod messages;
pub mod model;
pub mod processors;
pub mod service;
pub mod storage;

pub use context::CatalogScanContext;
pub use driver::{
    AggregatableDriver, BatchLeafDriver, CatalogScanDriver, CustomExpandableDriver,
    DriverCapabilities, DriverRegistry, DriverResult, RegisteredDriver, ReprocessableDriver,
};
pub use messages::{
    AggregateBucketMessage, CatalogIndexScanMessage, CatalogLeafScanMessage,
    CatalogPageScanMessage,
};
pub use model::{
    CatalogIndexScan, CatalogIndexScanResult, CatalogIndexScanState, CatalogLeafScan,
    CatalogPageScan, CatalogPageScanMode, CatalogPageScanResult, CatalogPageScanState,
    CatalogScanDriverType, CatalogScanKind, NUGET_ORG_MIN, NUGET_ORG_MIN_DELETED,
    ScanDependency, ScanId,
};
pub use processors::{
    AggregateBucketProcessor, CatalogIndexScanProcessor, CatalogLeafScanProcessor,
    CatalogPageScanProcessor,
};
pub use service::{CatalogScanService, CatalogScanState, CatalogScanUpdate};
pub use storage::CatalogScanStorage;
