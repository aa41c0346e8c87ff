//! Error types for harness operations.

use std::fmt;
use std::time::Duration;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Main error type for server orchestration.
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    /// Configuration synthesis or validation failed.
    Config {
        context: String,
        reason: String,
        diagnostics: String,
    },
    /// The server exited or closed its readiness stream before reporting ready.
    StartupFailed {
        token: String,
        reason: String,
        diagnostics: String,
    },
    AlreadyRunning {
        pid: u32,
    },
    DuplicateSuffix {
        suffix: String,
    },
    /// Operation needs a configuration mode the instance was not created with.
    UnsupportedMode {
        operation: String,
        mode: String,
    },
    NotImplemented {
        operation: String,
    },
    /// Malformed or mismatched readiness handshake.
    Protocol {
        context: String,
        reason: String,
    },
    /// A second handshake was requested for a token that is already pending.
    ConcurrencyUnsupported {
        token: String,
    },
    ConvergenceTimeout {
        base: String,
        uris: Vec<String>,
        reason: String,
    },
    Timeout {
        context: String,
        waited: Duration,
    },
    Io {
        context: String,
        reason: String,
    },
    /// Error reported by the directory client.
    Directory {
        operation: String,
        reason: String,
    },
    /// Invalid replication topology.
    Topology {
        reason: String,
    },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Config {
                context,
                reason,
                diagnostics,
            } => {
                write!(f, "Configuration error in {context}: {reason}")?;
                if !diagnostics.is_empty() {
                    write!(f, "\n{diagnostics}")?;
                }
                Ok(())
            }
            HarnessError::StartupFailed {
                token,
                reason,
                diagnostics,
            } => {
                write!(f, "Server '{token}' failed to start: {reason}")?;
                if !diagnostics.is_empty() {
                    write!(f, "\n{diagnostics}")?;
                }
                Ok(())
            }
            HarnessError::AlreadyRunning { pid } => {
                write!(f, "Server process {pid} still running")
            }
            HarnessError::DuplicateSuffix { suffix } => {
                write!(f, "Suffix '{suffix}' already configured in server")
            }
            HarnessError::UnsupportedMode { operation, mode } => {
                write!(f, "Operation '{operation}' is not supported in {mode} mode")
            }
            HarnessError::NotImplemented { operation } => {
                write!(f, "Operation '{operation}' is not implemented")
            }
            HarnessError::Protocol { context, reason } => {
                write!(f, "Protocol error in {context}: {reason}")
            }
            HarnessError::ConcurrencyUnsupported { token } => {
                write!(
                    f,
                    "Concurrent startup not implemented: handshake for '{token}' already pending"
                )
            }
            HarnessError::ConvergenceTimeout { base, uris, reason } => {
                write!(
                    f,
                    "Servers [{}] did not converge on '{base}': {reason}",
                    uris.join(", ")
                )
            }
            HarnessError::Timeout { context, waited } => {
                write!(f, "Timed out after {waited:?} in {context}")
            }
            HarnessError::Io { context, reason } => {
                write!(f, "I/O error in {context}: {reason}")
            }
            HarnessError::Directory { operation, reason } => {
                write!(f, "Directory operation '{operation}' failed: {reason}")
            }
            HarnessError::Topology { reason } => {
                write!(f, "Invalid replication topology: {reason}")
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl HarnessError {
    /// Errors caused by misuse of the API rather than by the environment.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            HarnessError::AlreadyRunning { .. }
                | HarnessError::DuplicateSuffix { .. }
                | HarnessError::UnsupportedMode { .. }
                | HarnessError::NotImplemented { .. }
                | HarnessError::ConcurrencyUnsupported { .. }
                | HarnessError::Topology { .. }
        )
    }

    /// Errors after which the instance that raised them cannot be used as is.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Config { .. }
                | HarnessError::StartupFailed { .. }
                | HarnessError::Protocol { .. }
        )
    }

    pub fn from_io_error(e: std::io::Error, context: &str) -> Self {
        HarnessError::Io {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }

    pub fn from_parse_error(e: impl fmt::Display, context: &str) -> Self {
        HarnessError::Config {
            context: context.to_string(),
            reason: e.to_string(),
            diagnostics: String::new(),
        }
    }

    pub fn from_directory_error(e: impl fmt::Display, operation: &str) -> Self {
        HarnessError::Directory {
            operation: operation.to_string(),
            reason: e.to_string(),
        }
    }
}
