//! A single directory server process under test.

use super::generate_secret;
use super::synthesis::{ConfigMode, Schema, SeedParameters, flat_config, structured_seed};
use crate::directory::{DirectoryClient, Modification, SearchScope, strip_ordering_prefix};
use crate::error::{HarnessError, Result};
use crate::pool::HarnessContext;
use crate::readiness::{Listener, ReadinessChannel, ReadinessConnection, StatusLine};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const CONFIG_ROOT: &str = "cn=config";
const LOG_FILE: &str = "slapd.log";
const SOCKET_FILE: &str = "socket";
const LOG_TAIL_LINES: usize = 20;
/// How often a pending start checks whether the process already died.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// What the instance remembers about a database it hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRecord {
    pub dn: String,
    pub root_dn: String,
    pub secret: String,
}

pub struct ServerInstance {
    token: String,
    secret: String,
    mode: ConfigMode,
    schemas: Vec<Schema>,
    port: u16,
    server_id: Option<u32>,
    suffixes: HashMap<String, DatabaseRecord>,
    process: Option<Child>,
    pid: Option<u32>,
    connection: Option<ReadinessConnection>,
    listeners: Vec<Listener>,
    context: HarnessContext,
    channel: Arc<ReadinessChannel>,
    home: TempDir,
    // Dropped after `home` so the pool root outlives every instance directory
    _root: Arc<TempDir>,
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let Ok(target) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to send signal {signal} to {pid}: {err}");
        }
    }
}

fn status_reason(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => format!("terminated ({status})"),
    }
}

impl ServerInstance {
    pub(crate) fn new(
        context: HarnessContext,
        channel: Arc<ReadinessChannel>,
        root: Arc<TempDir>,
        mode: ConfigMode,
        schemas: Vec<Schema>,
    ) -> Result<Self> {
        let home = tempfile::Builder::new()
            .prefix("server-")
            .tempdir_in(root.path())
            .map_err(|e| HarnessError::from_io_error(e, "creating server directory"))?;

        Ok(Self {
            token: generate_secret(),
            secret: generate_secret(),
            mode,
            schemas,
            port: 0,
            server_id: None,
            suffixes: HashMap::new(),
            process: None,
            pid: None,
            connection: None,
            listeners: Vec::new(),
            context,
            channel,
            home,
            _root: root,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Password of the `cn=config` root identity.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn mode(&self) -> ConfigMode {
        self.mode
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn server_id(&self) -> Option<u32> {
        self.server_id
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn suffixes(&self) -> &HashMap<String, DatabaseRecord> {
        &self.suffixes
    }

    pub fn suffix(&self, suffix: &str) -> Option<&DatabaseRecord> {
        self.suffixes
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(suffix))
            .map(|(_, record)| record)
    }

    pub fn has_suffix(&self, suffix: &str) -> bool {
        self.suffix(suffix).is_some()
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    pub fn log_path(&self) -> PathBuf {
        self.home.path().join(LOG_FILE)
    }

    /// `slapd.d` directory or `slapd.conf` file, depending on the mode.
    pub fn config_path(&self) -> PathBuf {
        self.home.path().join(self.mode.config_name())
    }

    /// Local-socket URL of the running server.
    pub fn uri(&self) -> String {
        let socket = self.home.path().join(SOCKET_FILE);
        format!("ldapi://{}", urlencoding::encode(&socket.to_string_lossy()))
    }

    pub(crate) fn register_database(&mut self, suffix: &str, record: DatabaseRecord) {
        self.suffixes.insert(suffix.to_string(), record);
    }

    pub(crate) fn unregister_database(&mut self, suffix: &str) {
        self.suffixes.retain(|known, _| !known.eq_ignore_ascii_case(suffix));
    }

    fn server_command(&self) -> Command {
        let mut command = Command::new(self.context.config.server_executable());
        command.current_dir(self.home.path());
        command
    }

    /// Create the configuration store unless it already exists.
    ///
    /// Returns `false` when there was nothing to do.
    #[tracing::instrument(level = "debug", skip(self, schemas), fields(token = %self.token, mode = %self.mode))]
    pub fn synthesize_config(&self, schemas: &[Schema]) -> Result<bool> {
        let target = self.config_path();
        if target.exists() {
            debug!("Configuration already present at {}", target.display());
            return Ok(false);
        }

        let schema_dir = self.context.config.schema_dir();
        let schemas: Vec<PathBuf> = schemas
            .iter()
            .map(|schema| schema.resolve(&schema_dir, self.mode))
            .collect();
        let module = self.context.config.harness_module();
        let host = self.channel.host();
        let params = SeedParameters {
            harness_module: &module,
            readiness_host: &host,
            readiness_port: self.channel.port(),
            token: &self.token,
            secret: &self.secret,
        };

        match self.mode {
            ConfigMode::Flat => fs::write(&target, flat_config(&params, &schemas))
                .map_err(|e| HarnessError::from_io_error(e, "writing slapd.conf"))?,
            ConfigMode::Structured => {
                fs::create_dir(&target)
                    .map_err(|e| HarnessError::from_io_error(e, "creating slapd.d"))?;
                if let Err(e) = self.seed_structured(&target, structured_seed(&params, &schemas)) {
                    let _ = fs::remove_dir_all(&target);
                    return Err(e);
                }
            }
        }

        info!("Synthesized {} configuration at {}", self.mode, target.display());
        Ok(true)
    }

    fn seed_structured(&self, target: &Path, ldif: String) -> Result<()> {
        let mut child = self
            .server_command()
            .args(["-T", "add", "-d", self.context.config.debug_level.as_str(), "-n0", "-F"])
            .arg(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarnessError::from_io_error(e, "launching configuration load"))?;

        // Fed from a separate thread so a chatty child cannot deadlock on a full stderr pipe
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                let _ = stdin.write_all(ldif.as_bytes());
            })
        });
        let output = child
            .wait_with_output()
            .map_err(|e| HarnessError::from_io_error(e, "configuration load"))?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            return Err(HarnessError::Config {
                context: "loading initial configuration".to_string(),
                reason: status_reason(output.status),
                diagnostics: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Dry-run the server against the synthesized configuration.
    #[tracing::instrument(level = "debug", skip(self), fields(token = %self.token))]
    pub fn validate(&self) -> Result<()> {
        let output = self
            .server_command()
            .args(["-T", "test", "-d", self.context.config.debug_level.as_str()])
            .arg(self.mode.config_flag())
            .arg(self.config_path())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| HarnessError::from_io_error(e, "launching configuration test"))?;

        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
            diagnostics.push_str(&String::from_utf8_lossy(&output.stdout));
            return Err(HarnessError::Config {
                context: "validating configuration".to_string(),
                reason: status_reason(output.status),
                diagnostics,
            });
        }
        Ok(())
    }

    /// Launch the server and block until it reports ready.
    #[tracing::instrument(level = "info", skip(self), fields(token = %self.token))]
    pub fn start(&mut self, port: Option<u16>) -> Result<()> {
        if let Some(child) = &self.process {
            return Err(HarnessError::AlreadyRunning { pid: child.id() });
        }

        self.synthesize_config(&self.schemas)?;
        self.validate()?;
        if let Some(port) = port {
            self.port = port;
        }

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(|e| HarnessError::from_io_error(e, "opening server log"))?;
        writeln!(
            log,
            "==== {} starting server {} ====",
            chrono::Local::now().to_rfc3339(),
            self.token
        )
        .map_err(|e| HarnessError::from_io_error(e, "writing server log"))?;

        let child = self
            .server_command()
            .args(["-d", self.context.config.debug_level.as_str()])
            .arg(self.mode.config_flag())
            .arg(self.config_path())
            .arg("-h")
            .arg(format!("ldapi://{SOCKET_FILE} ldap://localhost:{}", self.port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| HarnessError::StartupFailed {
                token: self.token.clone(),
                reason: format!("failed to launch server: {e}"),
                diagnostics: String::new(),
            })?;
        debug!("Launched server process {}", child.id());
        self.process = Some(child);

        if let Err(e) = self.await_ready() {
            self.abort_start();
            return Err(e);
        }
        info!("Server {} ready at {}", self.token, self.uri());
        Ok(())
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.process
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    fn log_tail(&self) -> String {
        let content = fs::read_to_string(self.log_path()).unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        lines[start..].join("\n")
    }

    fn startup_failed(&self, reason: String) -> HarnessError {
        HarnessError::StartupFailed {
            token: self.token.clone(),
            reason,
            diagnostics: self.log_tail(),
        }
    }

    fn await_ready(&mut self) -> Result<()> {
        let timeout = self.context.config.startup_timeout();
        let deadline = Instant::now() + timeout;

        let (mut connection, pid) = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .channel
                .await_start(&self.token, Some(remaining.min(EXIT_CHECK_INTERVAL)))
            {
                Ok(accepted) => break accepted,
                Err(HarnessError::Timeout { .. }) => {
                    if let Some(status) = self.exit_status() {
                        return Err(self.startup_failed(format!(
                            "process exited with {} before reporting",
                            status_reason(status)
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(HarnessError::Timeout {
                            context: format!("waiting for server '{}' to report", self.token),
                            waited: timeout,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        connection.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        loop {
            match connection.read_status()? {
                Some(StatusLine::Ready) => break,
                Some(StatusLine::Listener(listener)) => {
                    debug!("Server {pid} listening on {} ({})", listener.url, listener.name);
                    self.listeners.push(listener);
                }
                Some(StatusLine::Shutdown) | None => {
                    connection.close();
                    return Err(
                        self.startup_failed("status stream ended before readiness".to_string())
                    );
                }
                Some(other) => trace!("Server {pid} status: {other:?}"),
            }
        }
        connection.set_read_timeout(None)?;

        self.pid = Some(pid);
        self.connection = Some(connection);
        Ok(())
    }

    fn abort_start(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.pid = None;
        self.listeners.clear();
    }

    /// Stop the server: hang-up, then terminate, then wait for exit.
    #[tracing::instrument(level = "info", skip(self), fields(token = %self.token))]
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.process.take() else {
            return Ok(());
        };
        if let Some(pid) = self.pid.take() {
            send_signal(pid, libc::SIGHUP);
        }
        send_signal(child.id(), libc::SIGTERM);

        let connection = self.connection.take();
        self.listeners.clear();
        let status = child
            .wait()
            .map_err(|e| HarnessError::from_io_error(e, "waiting for server exit"))?;
        if let Some(connection) = connection {
            connection.close();
        }
        info!("Server {} stopped ({})", self.token, status_reason(status));
        Ok(())
    }

    /// New client connection to the local socket.
    pub fn connect(&self) -> Result<Box<dyn DirectoryClient>> {
        self.context.directory.connect(&self.uri())
    }

    /// Client bound as the `cn=config` root identity.
    pub fn admin_client(&self) -> Result<Box<dyn DirectoryClient>> {
        let mut client = self.connect()?;
        client.simple_bind(CONFIG_ROOT, &self.secret)?;
        Ok(client)
    }

    fn require_structured(&self, operation: &str) -> Result<()> {
        match self.mode {
            ConfigMode::Structured => Ok(()),
            mode => Err(HarnessError::UnsupportedMode {
                operation: operation.to_string(),
                mode: mode.to_string(),
            }),
        }
    }

    /// Make sure `module` is loaded; a module with the same base name counts.
    #[tracing::instrument(level = "debug", skip(self), fields(token = %self.token))]
    pub fn load_module(&self, module: &Path) -> Result<()> {
        self.require_structured("load module")?;
        let name = module.file_stem().ok_or_else(|| HarnessError::Config {
            context: "loading module".to_string(),
            reason: format!("'{}' has no file name", module.display()),
            diagnostics: String::new(),
        })?;

        let mut client = self.admin_client()?;
        let lists = client.search(
            CONFIG_ROOT,
            SearchScope::Subtree,
            "(objectClass=olcModuleList)",
            &["olcModuleLoad"],
        )?;

        for list in &lists {
            for loaded in list.values("olcModuleLoad") {
                if Path::new(strip_ordering_prefix(loaded)).file_stem() == Some(name) {
                    warn!(
                        "Module {} already loaded as {loaded}, skipping",
                        module.display()
                    );
                    return Ok(());
                }
            }
        }

        let value = module.display().to_string();
        match lists.first() {
            Some(list) => client.modify(
                &list.dn,
                &[Modification::Add("olcModuleLoad".to_string(), vec![value])],
            )?,
            None => client.add(
                &format!("cn=module,{CONFIG_ROOT}"),
                &vec![
                    ("objectClass".to_string(), vec!["olcModuleList".to_string()]),
                    ("olcModuleLoad".to_string(), vec![value]),
                ],
            )?,
        }
        debug!("Loaded module {}", module.display());
        Ok(())
    }

    /// Write the replication server identifier into the live configuration.
    pub fn set_server_id(&mut self, id: u32) -> Result<()> {
        self.require_structured("set server id")?;
        let mut client = self.admin_client()?;
        client.modify(
            CONFIG_ROOT,
            &[Modification::Replace(
                "olcServerID".to_string(),
                vec![id.to_string()],
            )],
        )?;
        self.server_id = Some(id);
        Ok(())
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop server {}: {e}", self.token);
        }
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("token", &self.token)
            .field("mode", &self.mode)
            .field("home", &self.home.path())
            .field("pid", &self.pid)
            .field("server_id", &self.server_id)
            .finish()
    }
}
