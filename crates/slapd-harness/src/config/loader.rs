//! Harness configuration loading.

use super::types::HarnessConfig;
use crate::HarnessError;
use std::path::Path;

/// Config loader with file I/O operations.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file path.
    /// Supports both JSON (.json) and YAML (.yaml/.yml) formats based on file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<HarnessConfig, HarnessError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::from_io_error(e, "harness config loading"))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let config: HarnessConfig = match extension.to_lowercase().as_str() {
            "json" => serde_json::from_str(&content)
                .map_err(|e| HarnessError::from_parse_error(e, "JSON harness config parsing"))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| HarnessError::from_parse_error(e, "YAML harness config parsing"))?,
            _ => serde_json::from_str(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .map_err(|e| {
                    HarnessError::from_parse_error(
                        e,
                        "harness config parsing (tried both JSON and YAML)",
                    )
                })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults with the source/build roots taken from the environment.
    pub fn from_env() -> HarnessConfig {
        HarnessConfig::default().with_env_overrides()
    }

    /// Load from `path` when given, otherwise fall back to [`ConfigLoader::from_env`].
    pub fn load(path: Option<&Path>) -> Result<HarnessConfig, HarnessError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::from_env()),
        }
    }
}
