//! Configuration entities created on running servers.

pub mod database;
pub mod overlay;

pub use database::{BackendKind, DEFAULT_MDB_MAX_SIZE, Database, database_entry};
pub use overlay::{Overlay, OverlayKind, OverlayPosition};
