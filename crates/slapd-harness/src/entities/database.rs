//! Database entries under `cn=config`.

use super::overlay::Overlay;
use crate::directory::Attributes;
use crate::error::{HarnessError, Result};
use crate::server::instance::CONFIG_ROOT;
use crate::server::{DatabaseRecord, ServerInstance, generate_secret};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MDB_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Backend a database is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Local memory-mapped storage.
    Mdb { max_size: u64 },
    /// Proxy to other servers.
    Ldap { uris: Vec<String> },
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Mdb {
            max_size: DEFAULT_MDB_MAX_SIZE,
        }
    }
}

impl BackendKind {
    pub fn ldap<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BackendKind::Ldap {
            uris: uris.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Mdb { .. } => "mdb",
            BackendKind::Ldap { .. } => "ldap",
        }
    }

    pub fn object_class(&self) -> &'static str {
        match self {
            BackendKind::Mdb { .. } => "olcMdbConfig",
            BackendKind::Ldap { .. } => "olcLDAPConfig",
        }
    }

    pub fn needs_storage(&self) -> bool {
        matches!(self, BackendKind::Mdb { .. })
    }

    fn backend_attributes(&self) -> Attributes {
        match self {
            BackendKind::Mdb { max_size } => {
                vec![("olcDbMaxSize".to_string(), vec![max_size.to_string()])]
            }
            BackendKind::Ldap { uris } => vec![("olcDbURI".to_string(), vec![uris.join(" ")])],
        }
    }
}

/// The config entry for a new database, in the order it is sent.
pub fn database_entry(
    suffix: &str,
    secret: &str,
    backend: &BackendKind,
    storage: Option<&Path>,
    extra: &Attributes,
) -> Attributes {
    let mut attrs: Attributes = vec![
        ("objectClass".to_string(), vec![backend.object_class().to_string()]),
        ("olcSuffix".to_string(), vec![suffix.to_string()]),
        ("olcRootDN".to_string(), vec![suffix.to_string()]),
        ("olcRootPW".to_string(), vec![secret.to_string()]),
    ];
    if let Some(storage) = storage {
        attrs.push((
            "olcDbDirectory".to_string(),
            vec![storage.display().to_string()],
        ));
    }
    attrs.extend(backend.backend_attributes());
    attrs.extend(extra.iter().cloned());
    attrs
}

/// A database hosted by one server.
#[derive(Debug, Clone)]
pub struct Database {
    server_token: String,
    server_uri: String,
    suffix: String,
    root_dn: String,
    secret: String,
    dn: String,
    backend: BackendKind,
    storage: Option<PathBuf>,
    overlays: Vec<Overlay>,
}

impl Database {
    /// Add a database for `suffix` and register it on `instance`.
    #[tracing::instrument(level = "info", skip(instance, backend, extra), fields(server = %instance.token(), backend = backend.name()))]
    pub fn create(
        instance: &mut ServerInstance,
        suffix: &str,
        backend: BackendKind,
        extra: Attributes,
    ) -> Result<Database> {
        if instance.has_suffix(suffix) {
            return Err(HarnessError::DuplicateSuffix {
                suffix: suffix.to_string(),
            });
        }

        let secret = generate_secret();
        let storage = if backend.needs_storage() {
            let path = instance
                .home()
                .join(format!("db-{}", &generate_secret()[..12]));
            fs::create_dir(&path)
                .map_err(|e| HarnessError::from_io_error(e, "creating database directory"))?;
            Some(path)
        } else {
            None
        };

        let entry = database_entry(suffix, &secret, &backend, storage.as_deref(), &extra);
        let requested = format!("olcDatabase={},{CONFIG_ROOT}", backend.name());
        let dn = instance
            .admin_client()
            .and_then(|mut client| client.add_with_post_read(&requested, &entry));
        let dn = match dn {
            Ok(dn) => dn,
            Err(e) => {
                if let Some(storage) = &storage {
                    let _ = fs::remove_dir_all(storage);
                }
                return Err(e);
            }
        };

        instance.register_database(
            suffix,
            DatabaseRecord {
                dn: dn.clone(),
                root_dn: suffix.to_string(),
                secret: secret.clone(),
            },
        );
        info!("Created {} database {dn} for {suffix}", backend.name());

        Ok(Database {
            server_token: instance.token().to_string(),
            server_uri: instance.uri(),
            suffix: suffix.to_string(),
            root_dn: suffix.to_string(),
            secret,
            dn,
            backend,
            storage,
            overlays: Vec::new(),
        })
    }

    /// Remove the database entry and its registration.
    pub fn delete(self, instance: &mut ServerInstance) -> Result<()> {
        self.ensure_owner(instance)?;
        let existed = instance.admin_client()?.delete(&self.dn)?;
        if !existed {
            debug!("Database {} was already gone", self.dn);
        }
        instance.unregister_database(&self.suffix);
        if let Some(storage) = &self.storage {
            if let Err(e) = fs::remove_dir_all(storage) {
                warn!("Failed to remove {}: {e}", storage.display());
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_owner(&self, instance: &ServerInstance) -> Result<()> {
        if instance.token() != self.server_token {
            return Err(HarnessError::Config {
                context: format!("database {}", self.dn),
                reason: format!(
                    "belongs to server {}, not {}",
                    self.server_token,
                    instance.token()
                ),
                diagnostics: String::new(),
            });
        }
        Ok(())
    }

    pub fn push_overlay(&mut self, overlay: Overlay) {
        self.overlays.push(overlay);
    }

    pub fn overlays(&self) -> &[Overlay] {
        &self.overlays
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// DN the server assigned to the database entry.
    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn root_dn(&self) -> &str {
        &self.root_dn
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn backend(&self) -> &BackendKind {
        &self.backend
    }

    pub fn storage(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    pub fn server_token(&self) -> &str {
        &self.server_token
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }
}
