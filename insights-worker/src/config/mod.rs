//! Layered worker configuration: defaults, then a TOML file, then the
//! environment.

pub mod loader;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigWarning, ConfigWarnings};
pub use sources::EnvConfig;
