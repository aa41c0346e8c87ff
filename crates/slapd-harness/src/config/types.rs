//! Harness configuration data structures.

use crate::HarnessError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the source tree root.
pub const SOURCE_ROOT_ENV: &str = "TOP_SRCDIR";
/// Environment variable naming the build tree root.
pub const BUILD_ROOT_ENV: &str = "TOP_BUILDDIR";

const DEFAULT_SCHEMAS: [&str; 5] = ["core", "cosine", "inetorgperson", "openldap", "nis"];

/// Locations of the server build and the knobs that control a test run.
///
/// Every path that is left unset is derived from `source_root` or
/// `build_root` using the standard source tree layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub source_root: PathBuf,
    pub build_root: Option<PathBuf>,
    pub server_executable: Option<PathBuf>,
    pub harness_module: Option<PathBuf>,
    pub schema_dir: Option<PathBuf>,
    pub overlay_dir: Option<PathBuf>,
    pub convergence_checker: PathBuf,
    pub debug_level: String,
    pub readiness_host: String,
    pub startup_timeout_secs: u64,
    pub convergence_timeout_secs: u64,
    pub teardown_grace_secs: u64,
    pub schemas: Vec<String>,
    pub mdb_max_size: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from(".."),
            build_root: None,
            server_executable: None,
            harness_module: None,
            schema_dir: None,
            overlay_dir: None,
            convergence_checker: PathBuf::from("synccheck"),
            debug_level: "-1".to_string(),
            readiness_host: "localhost".to_string(),
            startup_timeout_secs: 30,
            convergence_timeout_secs: 30,
            teardown_grace_secs: 5,
            schemas: DEFAULT_SCHEMAS.iter().map(|s| s.to_string()).collect(),
            mdb_max_size: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl HarnessConfig {
    /// Apply `TOP_SRCDIR` / `TOP_BUILDDIR` from the environment, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(src) = std::env::var(SOURCE_ROOT_ENV) {
            self.source_root = PathBuf::from(src);
        }
        if let Ok(build) = std::env::var(BUILD_ROOT_ENV) {
            self.build_root = Some(PathBuf::from(build));
        }
        self
    }

    pub fn source_root(&self) -> PathBuf {
        absolute(&self.source_root)
    }

    pub fn build_root(&self) -> PathBuf {
        match &self.build_root {
            Some(root) => absolute(root),
            None => self.source_root(),
        }
    }

    pub fn server_executable(&self) -> PathBuf {
        self.server_executable
            .clone()
            .unwrap_or_else(|| self.build_root().join("servers").join("slapd").join("slapd"))
    }

    pub fn harness_module(&self) -> PathBuf {
        self.harness_module.clone().unwrap_or_else(|| {
            self.build_root()
                .join("tests")
                .join("modules")
                .join("mod-harness")
                .join("mod_harness")
        })
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.schema_dir
            .clone()
            .unwrap_or_else(|| self.source_root().join("servers").join("slapd").join("schema"))
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.overlay_dir.clone().unwrap_or_else(|| {
            self.build_root()
                .join("servers")
                .join("slapd")
                .join("overlays")
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.teardown_grace_secs)
    }

    /// Reject values that would make every server start fail.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.debug_level.trim().is_empty() {
            return Err(invalid("debug_level", "must not be empty"));
        }
        if self.readiness_host.trim().is_empty() {
            return Err(invalid("readiness_host", "must not be empty"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(invalid("startup_timeout_secs", "must be positive"));
        }
        if self.convergence_timeout_secs == 0 {
            return Err(invalid("convergence_timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> HarnessError {
    HarnessError::Config {
        context: format!("harness configuration field '{field}'"),
        reason: reason.to_string(),
        diagnostics: String::new(),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
