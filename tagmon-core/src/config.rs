//! Validator configuration file and shared configuration errors.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable consulted when a configuration names no policy
/// directory.
pub const POLICY_DIR_ENV: &str = "GENERATED_POLICY_DIR";

/// Errors raised while loading any of the YAML configuration documents.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("while parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Schema(String),
    #[error("unknown metadata label name `{0}`")]
    UnknownLabel(String),
}

/// Top-level validator configuration.
///
/// ```yaml
/// policy_dir: /path/to/policy
/// tags_file: application.taginfo
/// soc_cfg_path: soc.yml
/// rule_cache:
///   name: dmhc
///   capacity: 1024
/// ap_entities:
///   ISA.RISCV.Reg.Env: 1
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,
    pub tags_file: PathBuf,
    pub soc_cfg_path: PathBuf,
    #[serde(default)]
    pub rule_cache: Option<RuleCacheConfig>,
    /// Attestation-point entities: dotted path -> numeric id.
    #[serde(default)]
    pub ap_entities: BTreeMap<String, u64>,
}

/// Rule cache selection: implementation name plus capacity.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleCacheConfig {
    pub name: String,
    #[serde(default)]
    pub capacity: usize,
}

impl ValidatorConfig {
    /// Loads a validator configuration document.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: ValidatorConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: path.to_owned(),
                source,
            })?;
        Ok(config)
    }

    /// The configured policy directory, falling back to the
    /// [`POLICY_DIR_ENV`] environment variable.
    pub fn policy_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.policy_dir {
            return Ok(dir.clone());
        }
        std::env::var_os(POLICY_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| {
                ConfigError::Schema(format!(
                    "no policy_dir in configuration and {POLICY_DIR_ENV} is unset"
                ))
            })
    }
}
