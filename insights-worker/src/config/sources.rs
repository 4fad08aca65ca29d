use std::{path::PathBuf, str::FromStr, time::Duration};

use insights_core::{config::StorageBackend, scan::CatalogScanDriverType};

use super::loader::ConfigLoadError;

pub const ENV_CONFIG_PATH: &str = "INSIGHTS_CONFIG";
pub const ENV_STORAGE_BACKEND: &str = "INSIGHTS_STORAGE_BACKEND";
pub const ENV_DATABASE_URL: &str = "INSIGHTS_DATABASE_URL";
pub const ENV_CATALOG_INDEX_URL: &str = "INSIGHTS_CATALOG_INDEX_URL";
pub const ENV_FLAT_CONTAINER_CURSOR_URL: &str = "INSIGHTS_FLAT_CONTAINER_CURSOR_URL";
pub const ENV_DISABLED_DRIVERS: &str = "INSIGHTS_DISABLED_DRIVERS";
pub const ENV_EXPAND_WORKERS: &str = "INSIGHTS_EXPAND_WORKERS";
pub const ENV_WORK_WORKERS: &str = "INSIGHTS_WORK_WORKERS";
pub const ENV_TIMER_TICK: &str = "INSIGHTS_TIMER_TICK";
pub const ENV_CATALOG_SCAN_UPDATE_FREQUENCY: &str = "INSIGHTS_CATALOG_SCAN_UPDATE_FREQUENCY";

/// Overrides read from the process environment. Every field wins over the
/// TOML file when set.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub storage_backend: Option<StorageBackend>,
    pub database_url: Option<String>,
    pub catalog_index_url: Option<String>,
    pub flat_container_cursor_url: Option<String>,
    pub disabled_drivers: Option<Vec<CatalogScanDriverType>>,
    pub expand_workers: Option<usize>,
    pub work_workers: Option<usize>,
    pub timer_tick: Option<Duration>,
    pub catalog_scan_update_frequency: Option<Duration>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigLoadError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env = Self::default();
        for (name, value) in vars {
            let value = value.trim().to_owned();
            if value.is_empty() {
                continue;
            }
            match name.as_str() {
                ENV_CONFIG_PATH => env.config_path = Some(PathBuf::from(value)),
                ENV_STORAGE_BACKEND => {
                    env.storage_backend = Some(match value.to_ascii_lowercase().as_str() {
                        "memory" => StorageBackend::Memory,
                        "postgres" => StorageBackend::Postgres,
                        _ => {
                            return Err(invalid(
                                &name,
                                &value,
                                "expected `memory` or `postgres`",
                            ));
                        }
                    })
                }
                ENV_DATABASE_URL => env.database_url = Some(value),
                ENV_CATALOG_INDEX_URL => env.catalog_index_url = Some(value),
                ENV_FLAT_CONTAINER_CURSOR_URL => env.flat_container_cursor_url = Some(value),
                ENV_DISABLED_DRIVERS => {
                    let drivers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(CatalogScanDriverType::from_str)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|err| invalid(&name, &value, &err.to_string()))?;
                    env.disabled_drivers = Some(drivers);
                }
                ENV_EXPAND_WORKERS => env.expand_workers = Some(parse_count(&name, &value)?),
                ENV_WORK_WORKERS => env.work_workers = Some(parse_count(&name, &value)?),
                ENV_TIMER_TICK => env.timer_tick = Some(parse_duration(&name, &value)?),
                ENV_CATALOG_SCAN_UPDATE_FREQUENCY => {
                    env.catalog_scan_update_frequency = Some(parse_duration(&name, &value)?)
                }
                _ => {}
            }
        }
        Ok(env)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, ConfigLoadError> {
    value
        .parse()
        .map_err(|err: std::num::ParseIntError| invalid(name, value, &err.to_string()))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(value).map_err(|err| invalid(name, value, &err.to_string()))
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigLoadError {
    ConfigLoadError::InvalidEnv {
        name: name.to_owned(),
        value: value.to_owned(),
        reason: reason.to_owned(),
    }
}
