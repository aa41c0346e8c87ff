//! Waiting for replicated servers to agree, via an external checker.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::server::ServerInstance;
use log::{debug, info, warn};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Longest wait for the checker's stderr once the checker itself is gone.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// SIGKILL the checker together with everything it spawned.
fn kill_process_group(pid: u32) {
    let Ok(group) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg(2) takes plain integers and has no memory-safety preconditions.
    if unsafe { libc::killpg(group, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill checker process group {pid}: {err}");
        }
    }
}

/// Runs `<checker> -p --base <base> --timeout <secs> <uri>...`.
#[derive(Debug, Clone)]
pub struct ConvergenceWaiter {
    checker: PathBuf,
    grace: Duration,
}

impl ConvergenceWaiter {
    pub fn new(checker: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            checker: checker.into(),
            grace,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.convergence_checker.clone(), config.teardown_grace())
    }

    pub fn checker(&self) -> &Path {
        &self.checker
    }

    /// Checker arguments; the timeout is rounded up to whole seconds.
    pub fn command_args(search_base: &str, uris: &[String], timeout: Duration) -> Vec<String> {
        let mut secs = timeout.as_secs();
        if timeout.subsec_nanos() > 0 || secs == 0 {
            secs += 1;
        }
        let mut args = vec![
            "-p".to_string(),
            "--base".to_string(),
            search_base.to_string(),
            "--timeout".to_string(),
            secs.to_string(),
        ];
        args.extend(uris.iter().cloned());
        args
    }

    /// Block until the checker reports that every URI holds the same content
    /// under `search_base`.
    #[tracing::instrument(level = "info", skip(self, uris), fields(servers = uris.len()))]
    pub fn wait_for_convergence(
        &self,
        search_base: &str,
        uris: &[String],
        timeout: Duration,
    ) -> Result<()> {
        let failed = |reason: String| HarnessError::ConvergenceTimeout {
            base: search_base.to_string(),
            uris: uris.to_vec(),
            reason,
        };

        let mut child = Command::new(&self.checker)
            .args(Self::command_args(search_base, uris, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                HarnessError::from_io_error(
                    e,
                    &format!("launching convergence checker {}", self.checker.display()),
                )
            })?;

        // Descendants of the checker may keep the pipe open, so the reader
        // hands its result over a channel instead of being joined.
        let (sender, captured) = mpsc::channel();
        let stderr = child.stderr.take();
        thread::spawn(move || {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut output);
            }
            let _ = sender.send(output);
        });
        let collect_stderr = || {
            captured
                .recv_timeout(STDERR_DRAIN)
                .map(|output| output.trim().to_string())
                .unwrap_or_default()
        };

        let bound = timeout + self.grace;
        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= bound => {
                    warn!("Convergence checker exceeded {bound:?}, killing it");
                    kill_process_group(child.id());
                    let _ = child.wait();
                    let stderr = collect_stderr();
                    return Err(failed(format!("checker still running after {bound:?}; {stderr}")));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill_process_group(child.id());
                    let _ = child.wait();
                    return Err(HarnessError::from_io_error(e, "waiting for convergence checker"));
                }
            }
        };

        let stderr = collect_stderr();
        if !status.success() {
            return Err(failed(format!("checker failed with {status}: {stderr}")));
        }
        if !stderr.is_empty() {
            debug!("Convergence checker output: {stderr}");
        }
        info!("Servers converged on {search_base} after {:?}", started.elapsed());
        Ok(())
    }

    /// Convenience over [`Self::wait_for_convergence`] for instances.
    pub fn wait_for_servers<'a>(
        &self,
        search_base: &str,
        servers: impl IntoIterator<Item = &'a ServerInstance>,
        timeout: Duration,
    ) -> Result<()> {
        let uris: Vec<String> = servers.into_iter().map(ServerInstance::uri).collect();
        self.wait_for_convergence(search_base, &uris, timeout)
    }
}
