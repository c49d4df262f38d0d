//! Init-config parsing
//!
//! The host hands the worker a JSON document describing which engines to
//! watch and where their sockets live. Unknown engine names are ignored so
//! newer hosts can ship configs that older workers simply skip.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, WorkerError};

const DEFAULT_LABEL_MAX_LEN: usize = 100;

/// Worker configuration, deserialized from the init-config JSON
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Label values longer than this are dropped from the normalized record
    #[serde(default = "default_label_max_len")]
    pub label_max_len: usize,

    /// Whether to query writable-layer sizes (an extra API call per inspect)
    #[serde(default)]
    pub with_size: bool,

    /// Engine name -> socket configuration
    #[serde(default)]
    pub engines: BTreeMap<String, EngineConfig>,
}

/// Per-engine socket configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub sockets: Vec<String>,
}

fn default_label_max_len() -> usize {
    DEFAULT_LABEL_MAX_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label_max_len: DEFAULT_LABEL_MAX_LEN,
            with_size: false,
            engines: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Parse the init-config JSON handed over by the host
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(WorkerError::Config)
    }

    /// Load configuration from a JSON file (used by the demo binary)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// The subset of settings every adapter needs
    pub fn settings(&self) -> Settings {
        Settings {
            label_max_len: self.label_max_len,
            with_size: self.with_size,
        }
    }
}

/// Normalization knobs shared by all adapters
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub label_max_len: usize,
    pub with_size: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_on_empty_config() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.label_max_len, 100);
        assert!(!config.with_size);
        assert!(config.engines.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "label_max_len": 50,
            "with_size": true,
            "engines": {
                "docker": {"enabled": true, "sockets": ["/var/run/docker.sock"]},
                "podman": {"enabled": false, "sockets": ["/run/podman/podman.sock"]},
                "frobnicator": {"enabled": true, "sockets": ["/run/frob.sock"]}
            }
        }"#;
        let config = Config::from_json(raw).unwrap();
        assert_eq!(config.label_max_len, 50);
        assert!(config.with_size);
        assert!(config.engines["docker"].enabled);
        assert!(!config.engines["podman"].enabled);
        // Unknown names survive parsing; engine construction skips them.
        assert!(config.engines.contains_key("frobnicator"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Config::from_json("{engines:").is_err());
    }
}
