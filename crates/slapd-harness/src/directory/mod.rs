//! Directory-protocol client seam.
//!
//! The harness only needs a handful of operations from a directory client:
//! bind, add (optionally returning the server-assigned DN through a post-read
//! control), delete, subtree search and modify. [`DirectoryClient`] captures
//! exactly that surface; [`DirectoryConnector`] opens clients by URI.

pub mod ldap;
pub mod memory;
pub mod types;

pub use ldap::{LdapClient, LdapDirectory};
pub use memory::InMemoryDirectory;
pub use types::{
    Attributes, DirectoryEntry, Modification, SearchScope, strip_ordering_prefix,
};

use crate::error::Result;

/// Operations the harness issues against a running server.
pub trait DirectoryClient {
    fn simple_bind(&mut self, dn: &str, secret: &str) -> Result<()>;

    fn add(&mut self, dn: &str, attrs: &Attributes) -> Result<()>;

    /// Add an entry and return the DN the server actually stored it under.
    fn add_with_post_read(&mut self, dn: &str, attrs: &Attributes) -> Result<String>;

    /// Delete an entry; `Ok(false)` when it did not exist.
    fn delete(&mut self, dn: &str) -> Result<bool>;

    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>>;

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<()>;
}

/// Opens directory clients.
pub trait DirectoryConnector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Box<dyn DirectoryClient>>;
}
