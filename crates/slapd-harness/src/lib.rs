//! Orchestration of OpenLDAP `slapd` processes for integration tests.
//!
//! A [`ServerPool`] hands out [`ServerInstance`]s that each own a scratch
//! directory. Starting an instance synthesizes its configuration, launches
//! the server and blocks on the pool's [`ReadinessChannel`] until the server
//! reports that its listeners are open. Running instances can then be given
//! databases and overlays, wired into a replication [`Mesh`], and checked for
//! convergence.

pub mod config;
pub mod convergence;
pub mod directory;
pub mod entities;
pub mod error;
pub mod pool;
pub mod readiness;
pub mod server;
pub mod telemetry;
pub mod topology;

pub use config::{ConfigLoader, HarnessConfig};
pub use convergence::ConvergenceWaiter;
pub use directory::{DirectoryClient, DirectoryConnector, InMemoryDirectory, LdapDirectory};
pub use entities::{BackendKind, Database, Overlay, OverlayKind, OverlayPosition};
pub use error::{HarnessError, Result};
pub use pool::{HarnessContext, ServerPool};
pub use readiness::{Listener, ReadinessChannel};
pub use server::{ConfigMode, Schema, ServerInstance};
pub use topology::{Adjacency, Mesh, MeshBuildError, MeshSpec, ReplicationTopology, SyncReplSource};

// Re-export logging macros for consistent usage across the crate
pub use log::{debug, error, info, trace, warn};
