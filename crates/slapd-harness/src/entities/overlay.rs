//! Overlay entries stacked on a database.

use super::database::Database;
use crate::directory::Attributes;
use crate::error::{HarnessError, Result};
use crate::server::ServerInstance;
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Which overlay to instantiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayKind {
    name: String,
    object_class: String,
    module: Option<PathBuf>,
}

impl OverlayKind {
    /// Overlay whose module is looked up by name in the overlay directory.
    pub fn new(name: impl Into<String>, object_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_class: object_class.into(),
            module: None,
        }
    }

    /// Overlay backed by an explicit module file; its stem names the overlay.
    pub fn from_module(module: impl Into<PathBuf>, object_class: impl Into<String>) -> Result<Self> {
        let module = module.into();
        let name = module
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| HarnessError::Config {
                context: "naming overlay".to_string(),
                reason: format!("'{}' has no file name", module.display()),
                diagnostics: String::new(),
            })?;
        Ok(Self {
            name,
            object_class: object_class.into(),
            module: Some(module),
        })
    }

    pub fn syncprov() -> Self {
        Self::new("syncprov", "olcSyncprovConfig")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_class(&self) -> &str {
        &self.object_class
    }

    pub fn module_path(&self, overlay_dir: &Path) -> PathBuf {
        match &self.module {
            Some(module) => module.clone(),
            None => overlay_dir.join(&self.name),
        }
    }
}

/// Where in the database's overlay stack the new overlay goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayPosition {
    #[default]
    Append,
    At(usize),
}

#[derive(Debug, Clone)]
pub struct Overlay {
    kind: OverlayKind,
    dn: String,
    database_dn: String,
}

impl Overlay {
    /// Load the overlay's module and add its entry under `database`.
    ///
    /// The result is not attached to `database`; pass it to
    /// [`Database::push_overlay`].
    #[tracing::instrument(level = "info", skip(instance, database, kind), fields(server = %instance.token(), overlay = kind.name()))]
    pub fn create(
        instance: &ServerInstance,
        database: &Database,
        kind: OverlayKind,
        position: OverlayPosition,
    ) -> Result<Overlay> {
        if let OverlayPosition::At(index) = position {
            return Err(HarnessError::NotImplemented {
                operation: format!("inserting overlay {} at position {index}", kind.name()),
            });
        }
        if kind.name().is_empty() {
            return Err(HarnessError::Config {
                context: "creating overlay".to_string(),
                reason: "overlay name is empty".to_string(),
                diagnostics: String::new(),
            });
        }
        database.ensure_owner(instance)?;

        let module = kind.module_path(&instance.context().config.overlay_dir());
        instance.load_module(&module)?;

        let entry: Attributes = vec![(
            "objectClass".to_string(),
            vec![kind.object_class().to_string()],
        )];
        let requested = format!("olcOverlay={},{}", kind.name(), database.dn());
        let dn = instance
            .admin_client()?
            .add_with_post_read(&requested, &entry)?;
        info!("Created overlay {dn}");

        Ok(Overlay {
            kind,
            dn,
            database_dn: database.dn().to_string(),
        })
    }

    pub fn delete(self, instance: &ServerInstance) -> Result<()> {
        if !instance.admin_client()?.delete(&self.dn)? {
            debug!("Overlay {} was already gone", self.dn);
        }
        Ok(())
    }

    pub fn kind(&self) -> &OverlayKind {
        &self.kind
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn database_dn(&self) -> &str {
        &self.database_dn
    }
}
