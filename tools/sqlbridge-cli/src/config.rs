///
/// # CLI Configuration
///
/// Optional TOML file read at startup. Every key is optional and every
/// value can be overridden on the command line.
///
/// ```toml
/// [worker]
/// open = "data/app.sqlite"
///
/// [log]
/// level = "debug"
/// ```
///

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub worker: WorkerSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    /// Database image opened before the first request.
    pub open: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<CliConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&content)
}

pub fn parse_config_str(content: &str) -> Result<CliConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}
