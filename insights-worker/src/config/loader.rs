use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use insights_core::config::{InsightsConfig, StorageBackend};
use once_cell::sync::Lazy;
use thiserror::Error;

use super::sources::EnvConfig;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("insights.toml"),
        PathBuf::from("config/insights.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Used instead of the process environment when set.
    pub env: Option<EnvConfig>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = match &self.options.env {
            Some(env) => env.clone(),
            None => EnvConfig::gather()?,
        };

        let mut warnings = ConfigWarnings::default();
        let (config, config_path) = match self.resolve_path(&env)? {
            Some(path) => (read_config(&path)?, Some(path)),
            None => {
                warnings.push_with_hint(
                    "No insights.toml detected; using defaults and environment variables",
                    "Pass --config or set INSIGHTS_CONFIG to point at a configuration file",
                );
                (InsightsConfig::default(), None)
            }
        };

        let config = apply_env(config, &env, &mut warnings);
        Ok(ConfigLoad {
            config,
            warnings,
            config_path,
            env_file_loaded,
        })
    }

    /// Explicit path, then `INSIGHTS_CONFIG`, then the first default
    /// location that exists. Only an explicit path must exist.
    fn resolve_path(&self, env: &EnvConfig) -> Result<Option<PathBuf>, ConfigLoadError> {
        if let Some(explicit) = &self.options.config_path {
            if !explicit.exists() {
                return Err(ConfigLoadError::MissingConfig {
                    path: explicit.clone(),
                });
            }
            return Ok(Some(explicit.clone()));
        }
        if let Some(from_env) = &env.config_path {
            return Ok(from_env.exists().then(|| from_env.clone()));
        }
        Ok(DEFAULT_CONFIG_LOCATIONS
            .iter()
            .find(|candidate| candidate.exists())
            .cloned())
    }
}

fn read_config(path: &Path) -> Result<InsightsConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

fn apply_env(
    mut config: InsightsConfig,
    env: &EnvConfig,
    warnings: &mut ConfigWarnings,
) -> InsightsConfig {
    if let Some(url) = &env.database_url {
        config.storage.database_url = Some(url.clone());
        if env.storage_backend.is_none() {
            config.storage.backend = StorageBackend::Postgres;
        }
    }
    if let Some(backend) = env.storage_backend {
        config.storage.backend = backend;
    }
    if let Some(url) = &env.catalog_index_url {
        config.catalog.index_url = url.clone();
    }
    if let Some(url) = &env.flat_container_cursor_url {
        config.catalog.flat_container_cursor_url = url.clone();
    }
    if let Some(drivers) = &env.disabled_drivers {
        config.scan.disabled_drivers = drivers.clone();
    }
    if let Some(workers) = env.expand_workers {
        config.queue.expand_workers = workers;
    }
    if let Some(workers) = env.work_workers {
        config.queue.work_workers = workers;
    }
    if let Some(tick) = env.timer_tick {
        config.timers.tick_interval_ms = tick.as_millis() as u64;
    }
    if let Some(frequency) = env.catalog_scan_update_frequency {
        config.timers.catalog_scan_update_frequency_secs = frequency.as_secs();
    }

    if config.storage.backend == StorageBackend::Postgres && config.storage.database_url.is_none()
    {
        warnings.push_with_hint(
            "storage.backend is postgres but no database URL is configured",
            "Set storage.database_url or INSIGHTS_DATABASE_URL",
        );
    }
    if config.storage.backend == StorageBackend::Memory {
        warnings.push(
            "Using in-memory storage; cursors and scans are lost when the process exits",
        );
    }
    if config.queue.expand_workers == 0 || config.queue.work_workers == 0 {
        warnings.push_with_hint(
            "A queue has zero workers; its messages will never be processed",
            "Set queue.expand_workers and queue.work_workers to at least 1",
        );
    }
    config
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: InsightsConfig,
    pub warnings: ConfigWarnings,
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {name}: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },
    #[error("failed to load .env file")]
    EnvFile(#[from] dotenvy::Error),
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use insights_core::scan::CatalogScanDriverType;
    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    fn loader(path: &Path, env: EnvConfig) -> ConfigLoader {
        ConfigLoader::new()
            .with_config_path(path)
            .with_env_file(path.with_extension("missing-env"))
            .with_env(env)
    }

    #[test]
    fn file_values_fill_in_over_defaults() {
        let file = write_config(
            r#"
[scan]
disabled_drivers = ["CatalogDataToCsv"]

[queue]
work_workers = 3
"#,
        );

        let load = loader(file.path(), EnvConfig::default())
            .load()
            .expect("load config");

        assert_eq!(
            load.config.scan.disabled_drivers,
            vec![CatalogScanDriverType::CatalogDataToCsv]
        );
        assert_eq!(load.config.queue.work_workers, 3);
        assert_eq!(load.config.queue.expand_workers, 2);
        assert_eq!(load.config_path.as_deref(), Some(file.path()));
        assert!(!load.env_file_loaded);
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_config(
            r#"
[queue]
work_workers = 3

[timers]
tick_interval_ms = 1000
"#,
        );
        let env = EnvConfig {
            work_workers: Some(5),
            timer_tick: Some(Duration::from_secs(30)),
            database_url: Some("postgres://localhost/insights".into()),
            ..EnvConfig::default()
        };

        let load = loader(file.path(), env).load().expect("load config");

        assert_eq!(load.config.queue.work_workers, 5);
        assert_eq!(load.config.timers.tick_interval_ms, 30_000);
        assert_eq!(load.config.storage.backend, StorageBackend::Postgres);
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("nope.toml");

        let err = loader(&missing, EnvConfig::default())
            .load()
            .expect_err("missing config");
        assert!(matches!(err, ConfigLoadError::MissingConfig { path } if path == missing));
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let file = write_config("[queue\nwork_workers = ");

        let err = loader(file.path(), EnvConfig::default())
            .load()
            .expect_err("malformed config");
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }
}
