//! Rendering of the initial server configuration.

use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// How a server instance keeps its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    /// Directory-backed configuration (`slapd.d`, cn=config), editable at runtime.
    #[default]
    Structured,
    /// Single `slapd.conf` file.
    Flat,
}

impl ConfigMode {
    /// Command-line switch that points the server at its configuration.
    pub fn config_flag(&self) -> &'static str {
        match self {
            ConfigMode::Structured => "-F",
            ConfigMode::Flat => "-f",
        }
    }

    pub fn config_name(&self) -> &'static str {
        match self {
            ConfigMode::Structured => "slapd.d",
            ConfigMode::Flat => "slapd.conf",
        }
    }

    pub fn schema_extension(&self) -> &'static str {
        match self {
            ConfigMode::Structured => "ldif",
            ConfigMode::Flat => "schema",
        }
    }
}

impl fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMode::Structured => write!(f, "structured"),
            ConfigMode::Flat => write!(f, "flat-file"),
        }
    }
}

/// A schema to include: a well-known name or an explicit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    Named(String),
    Path(PathBuf),
}

impl Schema {
    /// Named schemas resolve to `<schema_dir>/<name>.<ext>` for the mode.
    pub fn resolve(&self, schema_dir: &Path, mode: ConfigMode) -> PathBuf {
        match self {
            Schema::Named(name) => {
                schema_dir.join(format!("{name}.{}", mode.schema_extension()))
            }
            Schema::Path(path) => path.clone(),
        }
    }
}

impl From<&str> for Schema {
    fn from(name: &str) -> Self {
        Schema::Named(name.to_string())
    }
}

impl From<String> for Schema {
    fn from(name: String) -> Self {
        Schema::Named(name)
    }
}

impl From<PathBuf> for Schema {
    fn from(path: PathBuf) -> Self {
        Schema::Path(path)
    }
}

/// Values baked into a new configuration.
#[derive(Debug, Clone)]
pub struct SeedParameters<'a> {
    pub harness_module: &'a Path,
    pub readiness_host: &'a str,
    pub readiness_port: u16,
    pub token: &'a str,
    pub secret: &'a str,
}

/// LDIF fed to the offline add tool to create `slapd.d`.
pub fn structured_seed(params: &SeedParameters<'_>, schemas: &[PathBuf]) -> String {
    let mut ldif = format!(
        "dn: cn=config\n\
         objectClass: olcGlobal\n\
         cn: config\n\
         \n\
         dn: cn=module{{0}},cn=config\n\
         objectClass: olcModuleList\n\
         cn: module{{0}}\n\
         olcModuleLoad: {module}\n\
         \n\
         dn: cn=schema,cn=config\n\
         objectClass: olcSchemaConfig\n\
         cn: schema\n\
         \n\
         dn: olcBackend={{0}}harness,cn=config\n\
         objectClass: olcBkHarnessConfig\n\
         olcBkHarnessHost: {host}\n\
         olcBkHarnessPort: {port}\n\
         olcBkHarnessIdentifier: {token}\n\
         \n\
         dn: olcDatabase={{0}}config,cn=config\n\
         objectClass: olcDatabaseConfig\n\
         olcRootPW: {secret}\n\
         \n",
        module = params.harness_module.display(),
        host = params.readiness_host,
        port = params.readiness_port,
        token = params.token,
        secret = params.secret,
    );
    for schema in schemas {
        let _ = writeln!(ldif, "include: file://{}", schema.display());
    }
    ldif
}

/// Contents of `slapd.conf`.
pub fn flat_config(params: &SeedParameters<'_>, schemas: &[PathBuf]) -> String {
    let mut conf = format!(
        "moduleload {module}\n\
         \n\
         backend harness\n\
         host {host}\n\
         port {port}\n\
         identifier {token}\n\
         \n\
         database config\n\
         rootpw {secret}\n\
         \n",
        module = params.harness_module.display(),
        host = params.readiness_host,
        port = params.readiness_port,
        token = params.token,
        secret = params.secret,
    );
    for schema in schemas {
        let _ = writeln!(conf, "include {}", schema.display());
    }
    conf
}
