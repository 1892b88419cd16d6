use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::model::{DEFAULT_DESCRIPTION_LENGTH, ProjectionSettings};
use crate::store::logseq::DEFAULT_API_URL;

#[derive(Parser, Debug)]
#[command(name = "koreader-sync")]
#[command(about = "Syncs KOReader highlights into a block-based notes graph", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
    /// Overrides `sync.metadata_dir`.
    #[arg(short = 'd', long = "dir")]
    pub metadata_dir: Option<String>,
    /// Overrides `sync.page`.
    #[arg(short = 'p', long = "page")]
    pub page: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".koreader-sync")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

fn default_page() -> String {
    "_logseq-koreader-sync".to_string()
}

fn default_description_length() -> usize {
    DEFAULT_DESCRIPTION_LENGTH
}

fn default_collapse() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    default_config_dir().join("graph.json")
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    #[serde(default = "default_page")]
    pub page: String,
    #[serde(default = "default_description_length")]
    pub description_max_length: usize,
    #[serde(default = "default_collapse")]
    pub collapse_blocks: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            metadata_dir: None,
            page: default_page(),
            description_max_length: default_description_length(),
            collapse_blocks: default_collapse(),
        }
    }
}

impl SyncSettings {
    pub fn projection(&self) -> ProjectionSettings {
        ProjectionSettings {
            description_max_length: self.description_max_length,
            collapse_blocks: self.collapse_blocks,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSettings {
    File {
        #[serde(default = "default_store_path")]
        path: PathBuf,
    },
    Logseq {
        #[serde(default = "default_api_url")]
        api_url: String,
        #[serde(default)]
        api_token: Option<String>,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::File {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        Ok(cfg)
    }

    /// Loads `path`, or the defaults when the file does not exist.
    pub fn new_or_default(path: &str) -> Result<Self> {
        if fs::metadata(path).is_err() {
            tracing::info!(path, "no config file, using defaults");
            return Ok(Config::default());
        }
        Config::new(path)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        Ok(config)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find("}") {
                let var_name = &result[actual_start + 2..actual_start + end];

                // Handle default values like ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!("Environment variable '{}' not found", var_name);
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.sync.page, "_logseq-koreader-sync");
        assert_eq!(cfg.sync.description_max_length, 250);
        assert!(cfg.sync.collapse_blocks);
        assert!(matches!(cfg.store, StoreSettings::File { .. }));
    }

    #[test]
    fn test_logseq_store_with_env_default() {
        let yaml = r#"
sync:
  metadata_dir: ${KOREADER_SYNC_TEST_UNSET_DIR:-/mnt/reader}
  page: Reading
  description_max_length: 80
  collapse_blocks: false
store:
  kind: logseq
  api_token: ${KOREADER_SYNC_TEST_UNSET_TOKEN:-abc}
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.sync.metadata_dir, Some(PathBuf::from("/mnt/reader")));
        assert_eq!(cfg.sync.page, "Reading");
        assert_eq!(
            cfg.sync.projection(),
            ProjectionSettings {
                description_max_length: 80,
                collapse_blocks: false
            }
        );
        assert_eq!(
            cfg.store,
            StoreSettings::Logseq {
                api_url: DEFAULT_API_URL.to_string(),
                api_token: Some("abc".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_store_kind_fails() {
        assert!(Config::from_yaml("store:\n  kind: s3\n").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        let cfg = Config::new_or_default(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.sync.page, "_logseq-koreader-sync");
    }
}
