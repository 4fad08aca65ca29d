//! Built-in catalog scan drivers.

pub mod latest_leaf;
pub mod version_set;

pub use latest_leaf::{LatestLeafDriver, LatestPackageLeaf};
pub use version_set::{VersionSetDriver, VersionSetEntry};
