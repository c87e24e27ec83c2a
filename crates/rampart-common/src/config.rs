//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Configuration discovery and loading helpers."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

/// Environment variable consulted before any candidate path.
pub const ENV_CONFIG_PATH: &str = "RAMPART_CONFIG";

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_file_output() -> bool {
    true
}

/// Structural checks run after a configuration document has been parsed.
pub trait Validate {
    /// Return an error describing the first violated invariant.
    fn validate(&self) -> Result<()>;
}

/// A parsed configuration together with the file it was read from.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub config: T,
    pub source: PathBuf,
}

/// Load the first configuration that can be found.
///
/// The path named by `env_var` wins when it is set and non-empty; otherwise
/// the candidates are inspected in order and the first existing file is used.
pub fn load_with_source<T, P>(env_var: &str, candidates: &[P]) -> Result<Loaded<T>>
where
    T: DeserializeOwned + Validate,
    P: AsRef<Path>,
{
    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.trim().is_empty() {
            let path = PathBuf::from(env_path);
            let config = from_path(&path)?;
            return Ok(Loaded {
                config,
                source: path,
            });
        }
    }

    for candidate in candidates {
        if candidate.as_ref().exists() {
            let path = candidate.as_ref().to_path_buf();
            let config = from_path(&path)?;
            return Ok(Loaded {
                config,
                source: path,
            });
        }
    }

    Err(anyhow!(
        "no configuration files found. inspected: {}",
        candidates
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

/// Read, parse and validate a TOML document from disk.
pub fn from_path<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let path = path.as_ref();
    debug!(config_path = %path.display(), "loading configuration");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    parse_toml(&contents).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse and validate a TOML document held in memory.
pub fn parse_toml<T>(contents: &str) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let config = toml::from_str::<T>(contents).context("failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Disable to log to stdout only (useful for short-lived CLI invocations).
    #[serde(default = "default_file_output")]
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_output: default_file_output(),
        }
    }
}
