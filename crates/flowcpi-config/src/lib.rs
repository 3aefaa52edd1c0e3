pub mod error;

pub use error::*;

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

const CONFIG_ENV: &str = "FLOWCPI_CONFIG";
const CANDIDATES: [&str; 3] = ["cpi.yml", "cpi.yaml", "cpi.json"];
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Process-wide configuration, read-only after load
#[derive(Debug, Clone)]
pub struct CpiConfig {
    pub cloud: CloudPlugin,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

/// Backend selected by `cloud.plugin`
#[derive(Debug, Clone, PartialEq)]
pub enum CloudPlugin {
    Memory,
    Sakura(SakuraProperties),
}

impl CloudPlugin {
    pub fn name(&self) -> &'static str {
        match self {
            CloudPlugin::Memory => "memory",
            CloudPlugin::Sakura(_) => "sakura",
        }
    }
}

/// `cloud.properties` for the sakura plugin
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SakuraProperties {
    pub zone: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_usacloud_path")]
    pub usacloud_path: String,
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_usacloud_path() -> String {
    "usacloud".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl CpiConfig {
    /// Configuration using the in-memory backend and defaults
    pub fn memory() -> Self {
        Self {
            cloud: CloudPlugin::Memory,
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");

        let doc: Value = if is_json {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_value(&doc)
    }

    /// Validate a raw configuration document
    pub fn from_value(doc: &Value) -> Result<Self> {
        let plugin = require(doc, "cloud.plugin")?
            .as_str()
            .ok_or_else(|| ConfigError::InvalidValue {
                path: "cloud.plugin".to_string(),
                message: "expected a string".to_string(),
            })?;

        let cloud = match plugin {
            "memory" => CloudPlugin::Memory,
            "sakura" => {
                require(doc, "cloud.properties.zone")?;
                CloudPlugin::Sakura(typed(doc, "cloud.properties")?)
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    path: "cloud.plugin".to_string(),
                    message: format!("unknown plugin '{}'", other),
                });
            }
        };

        let pool: PoolConfig = optional(doc, "pool")?.unwrap_or_default();
        if pool.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                path: "pool.max_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let logging: LoggingConfig = optional(doc, "logging")?.unwrap_or_default();

        Ok(Self {
            cloud,
            pool,
            logging,
        })
    }
}

/// Look up a dotted path, failing with the first missing segment's full path
pub fn require<'a>(doc: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = doc;
    let mut seen = Vec::new();
    for segment in path.split('.') {
        seen.push(segment);
        current = match current.get(segment) {
            Some(v) if !v.is_null() => v,
            _ => return Err(ConfigError::MissingKey(seen.join("."))),
        };
    }
    Ok(current)
}

fn typed<T: serde::de::DeserializeOwned>(doc: &Value, path: &str) -> Result<T> {
    let value = require(doc, path)?;
    serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn optional<T: serde::de::DeserializeOwned>(doc: &Value, path: &str) -> Result<Option<T>> {
    match require(doc, path) {
        Ok(_) => typed(doc, path).map(Some),
        Err(ConfigError::MissingKey(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Locate the configuration file
///
/// Search order:
/// 1. explicit path (`--config`)
/// 2. environment variable FLOWCPI_CONFIG
/// 3. current directory: cpi.yml, cpi.yaml, cpi.json
/// 4. ~/.config/flowcpi/cpi.yml
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )))
        };
    }

    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("flowcpi").join("cpi.yml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigNotFound)
}
