//! Server instances and their configuration.

pub mod instance;
pub mod synthesis;

pub use instance::{DatabaseRecord, ServerInstance};
pub use synthesis::{ConfigMode, Schema, SeedParameters};

/// Random identifier used for readiness tokens and administrative secrets.
pub fn generate_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
