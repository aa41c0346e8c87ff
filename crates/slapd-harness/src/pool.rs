//! Factory for server instances sharing one readiness channel and one
//! temporary-directory root.

use crate::config::HarnessConfig;
use crate::directory::{DirectoryConnector, LdapDirectory};
use crate::error::{HarnessError, Result};
use crate::readiness::ReadinessChannel;
use crate::server::{ConfigMode, Schema, ServerInstance};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Configuration plus the directory connector, handed to every pool.
#[derive(Clone)]
pub struct HarnessContext {
    pub config: Arc<HarnessConfig>,
    pub directory: Arc<dyn DirectoryConnector>,
}

impl HarnessContext {
    /// Context talking to real servers over LDAP.
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_directory(config, Arc::new(LdapDirectory))
    }

    pub fn with_directory(config: HarnessConfig, directory: Arc<dyn DirectoryConnector>) -> Self {
        Self {
            config: Arc::new(config),
            directory,
        }
    }
}

/// A server created by the pool, as recorded at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub token: String,
    pub home: PathBuf,
    pub mode: ConfigMode,
}

pub struct ServerPool {
    context: HarnessContext,
    channel: Arc<ReadinessChannel>,
    root: Arc<TempDir>,
    registry: Vec<PoolEntry>,
}

impl ServerPool {
    /// Pool rooted in a fresh directory under the system temp dir.
    pub fn new(context: HarnessContext) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("slapd-harness-")
            .tempdir()
            .map_err(|e| HarnessError::from_io_error(e, "creating pool directory"))?;
        Self::with_root_dir(context, root)
    }

    /// Pool rooted in a fresh directory under `parent`.
    pub fn in_dir(context: HarnessContext, parent: &Path) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("slapd-harness-")
            .tempdir_in(parent)
            .map_err(|e| HarnessError::from_io_error(e, "creating pool directory"))?;
        Self::with_root_dir(context, root)
    }

    fn with_root_dir(context: HarnessContext, root: TempDir) -> Result<Self> {
        let channel = ReadinessChannel::open(&context.config.readiness_host, 0)?;
        info!(
            "Server pool at {} reporting to {}",
            root.path().display(),
            channel.address()
        );
        Ok(Self {
            context,
            channel: Arc::new(channel),
            root: Arc::new(root),
            registry: Vec::new(),
        })
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.context.config
    }

    pub fn channel(&self) -> &ReadinessChannel {
        &self.channel
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Every server this pool has handed out.
    pub fn servers(&self) -> &[PoolEntry] {
        &self.registry
    }

    /// Structured-mode server with the configured default schemas.
    pub fn new_server(&mut self) -> Result<ServerInstance> {
        self.new_server_with(ConfigMode::Structured, None)
    }

    /// Server in `mode`; `schemas` overrides the configured default list.
    pub fn new_server_with(
        &mut self,
        mode: ConfigMode,
        schemas: Option<Vec<Schema>>,
    ) -> Result<ServerInstance> {
        let schemas = schemas.unwrap_or_else(|| {
            self.context
                .config
                .schemas
                .iter()
                .map(|name| Schema::from(name.as_str()))
                .collect()
        });
        let instance = ServerInstance::new(
            self.context.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.root),
            mode,
            schemas,
        )?;

        debug!(
            "Created server {} in {}",
            instance.token(),
            instance.home().display()
        );
        self.registry.push(PoolEntry {
            token: instance.token().to_string(),
            home: instance.home().to_path_buf(),
            mode,
        });
        Ok(instance)
    }
}
