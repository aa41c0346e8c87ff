//! In-memory directory used when no real server should be contacted.
//!
//! Each URI gets its own tree, seeded with a minimal `cn=config`. Adds under
//! ordered RDN types (`olcDatabase`, `olcOverlay`, `olcBackend`, `cn=module`)
//! are given the `{n}` index the server would assign. Every request is
//! recorded so callers can assert on what was sent.

use super::types::{Attributes, DirectoryEntry, Modification, SearchScope};
use super::{DirectoryClient, DirectoryConnector};
use crate::error::{HarnessError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const ORDERED_PREFIX_TYPES: [&str; 3] = ["olcDatabase", "olcOverlay", "olcBackend"];

/// A request received by an [`InMemoryDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOperation {
    Connect { uri: String },
    Bind { uri: String, dn: String },
    Add { uri: String, dn: String, attrs: Attributes },
    Delete { uri: String, dn: String },
    Search { uri: String, base: String, filter: String },
    Modify { uri: String, dn: String, mods: Vec<Modification> },
}

impl RecordedOperation {
    pub fn uri(&self) -> &str {
        match self {
            RecordedOperation::Connect { uri }
            | RecordedOperation::Bind { uri, .. }
            | RecordedOperation::Add { uri, .. }
            | RecordedOperation::Delete { uri, .. }
            | RecordedOperation::Search { uri, .. }
            | RecordedOperation::Modify { uri, .. } => uri,
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    trees: HashMap<String, Vec<DirectoryEntry>>,
    seed: Vec<DirectoryEntry>,
    operations: Vec<RecordedOperation>,
    unreachable: Vec<String>,
}

impl DirectoryState {
    fn tree(&mut self, uri: &str) -> &mut Vec<DirectoryEntry> {
        let seed = &self.seed;
        self.trees
            .entry(uri.to_string())
            .or_insert_with(|| seed.clone())
    }
}

/// Shared handle; clones observe the same trees and operation log.
#[derive(Clone)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        let mut config = DirectoryEntry::new("cn=config");
        config
            .attrs
            .insert("objectClass".to_string(), vec!["olcGlobal".to_string()]);
        let mut config_db = DirectoryEntry::new("olcDatabase={0}config,cn=config");
        config_db.attrs.insert(
            "objectClass".to_string(),
            vec!["olcDatabaseConfig".to_string()],
        );

        Self {
            state: Arc::new(Mutex::new(DirectoryState {
                seed: vec![config, config_db],
                ..DirectoryState::default()
            })),
        }
    }

    /// Add an entry to the seed copied into every tree created from now on.
    pub fn with_seed_entry(self, entry: DirectoryEntry) -> Self {
        self.state.lock().seed.push(entry);
        self
    }

    /// Make connections to `uri` fail.
    pub fn set_unreachable(&self, uri: &str) {
        self.state.lock().unreachable.push(uri.to_string());
    }

    pub fn operations(&self) -> Vec<RecordedOperation> {
        self.state.lock().operations.clone()
    }

    /// Operations sent to one URI.
    pub fn operations_for(&self, uri: &str) -> Vec<RecordedOperation> {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| op.uri() == uri)
            .cloned()
            .collect()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    pub fn entries(&self, uri: &str) -> Vec<DirectoryEntry> {
        self.state.lock().trees.get(uri).cloned().unwrap_or_default()
    }

    pub fn entry(&self, uri: &str, dn: &str) -> Option<DirectoryEntry> {
        self.state
            .lock()
            .trees
            .get(uri)
            .and_then(|tree| tree.iter().find(|e| e.dn.eq_ignore_ascii_case(dn)).cloned())
    }
}

impl DirectoryConnector for InMemoryDirectory {
    fn connect(&self, uri: &str) -> Result<Box<dyn DirectoryClient>> {
        let mut state = self.state.lock();
        state.operations.push(RecordedOperation::Connect {
            uri: uri.to_string(),
        });
        if state.unreachable.iter().any(|u| u == uri) {
            return Err(HarnessError::Directory {
                operation: format!("connect {uri}"),
                reason: "connection refused".to_string(),
            });
        }
        state.tree(uri);
        Ok(Box::new(InMemoryClient {
            state: Arc::clone(&self.state),
            uri: uri.to_string(),
        }))
    }
}

struct InMemoryClient {
    state: Arc<Mutex<DirectoryState>>,
    uri: String,
}

fn split_dn(dn: &str) -> (&str, &str) {
    dn.split_once(',').unwrap_or((dn, ""))
}

fn rdn_type(rdn: &str) -> &str {
    rdn.split_once('=').map(|(attr, _)| attr).unwrap_or(rdn)
}

fn directory_error(operation: &str, dn: &str, reason: &str) -> HarnessError {
    HarnessError::Directory {
        operation: format!("{operation} {dn}"),
        reason: reason.to_string(),
    }
}

/// The DN the entry is stored under once ordering indices are assigned.
fn assign_ordering(tree: &[DirectoryEntry], dn: &str) -> String {
    let (rdn, parent) = split_dn(dn);
    let Some((attr, value)) = rdn.split_once('=') else {
        return dn.to_string();
    };
    let siblings = tree
        .iter()
        .filter(|e| {
            let (sibling_rdn, sibling_parent) = split_dn(&e.dn);
            sibling_parent.eq_ignore_ascii_case(parent)
                && rdn_type(sibling_rdn).eq_ignore_ascii_case(attr)
        })
        .count();

    if ORDERED_PREFIX_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(attr))
        && !value.starts_with('{')
    {
        return format!("{attr}={{{siblings}}}{value},{parent}");
    }
    if attr.eq_ignore_ascii_case("cn") && value.eq_ignore_ascii_case("module") {
        let modules = tree
            .iter()
            .filter(|e| {
                let (sibling_rdn, sibling_parent) = split_dn(&e.dn);
                sibling_parent.eq_ignore_ascii_case(parent)
                    && sibling_rdn.to_ascii_lowercase().starts_with("cn=module")
            })
            .count();
        return format!("{attr}={value}{{{modules}}},{parent}");
    }
    dn.to_string()
}

fn in_scope(entry_dn: &str, base: &str, scope: SearchScope) -> bool {
    let entry_dn = entry_dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    match scope {
        SearchScope::Base => entry_dn == base,
        SearchScope::OneLevel => split_dn(&entry_dn).1 == base,
        SearchScope::Subtree => entry_dn == base || entry_dn.ends_with(&format!(",{base}")),
    }
}

/// Equality and presence filters on a single attribute.
fn matches_filter(entry: &DirectoryEntry, filter: &str) -> bool {
    let filter = filter.trim().trim_start_matches('(').trim_end_matches(')');
    let Some((attr, wanted)) = filter.split_once('=') else {
        return false;
    };
    let values = entry.values(attr);
    if wanted == "*" {
        return !values.is_empty() || attr.eq_ignore_ascii_case("objectClass");
    }
    values.iter().any(|v| v.eq_ignore_ascii_case(wanted))
}

fn project(entry: &DirectoryEntry, attrs: &[&str]) -> DirectoryEntry {
    if attrs.is_empty() || attrs.contains(&"*") {
        return entry.clone();
    }
    DirectoryEntry {
        dn: entry.dn.clone(),
        attrs: entry
            .attrs
            .iter()
            .filter(|(name, _)| attrs.iter().any(|a| a.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect(),
    }
}

fn apply_modification(attrs: &mut BTreeMap<String, Vec<String>>, modification: &Modification) {
    let existing = attrs
        .keys()
        .find(|name| name.eq_ignore_ascii_case(modification.attribute()))
        .cloned()
        .unwrap_or_else(|| modification.attribute().to_string());

    match modification {
        Modification::Add(_, values) => {
            attrs
                .entry(existing)
                .or_default()
                .extend(values.iter().cloned());
        }
        Modification::Replace(_, values) if values.is_empty() => {
            attrs.remove(&existing);
        }
        Modification::Replace(_, values) => {
            attrs.insert(existing, values.clone());
        }
        Modification::Delete(_, values) if values.is_empty() => {
            attrs.remove(&existing);
        }
        Modification::Delete(_, values) => {
            if let Some(current) = attrs.get_mut(&existing) {
                current.retain(|v| !values.contains(v));
                if current.is_empty() {
                    attrs.remove(&existing);
                }
            }
        }
    }
}

impl InMemoryClient {
    fn insert(&mut self, dn: &str, attrs: &Attributes) -> Result<String> {
        let mut state = self.state.lock();
        state.operations.push(RecordedOperation::Add {
            uri: self.uri.clone(),
            dn: dn.to_string(),
            attrs: attrs.clone(),
        });

        let tree = state.tree(&self.uri);
        let (_, parent) = split_dn(dn);
        if !parent.is_empty() && !tree.iter().any(|e| e.dn.eq_ignore_ascii_case(parent)) {
            return Err(directory_error("add", dn, "noSuchObject (32): parent missing"));
        }

        let stored = assign_ordering(tree, dn);
        if tree.iter().any(|e| e.dn.eq_ignore_ascii_case(&stored)) {
            return Err(directory_error("add", dn, "entryAlreadyExists (68)"));
        }

        let mut entry = DirectoryEntry::new(stored.clone());
        for (attr, values) in attrs {
            entry
                .attrs
                .entry(attr.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        tree.push(entry);
        Ok(stored)
    }
}

impl DirectoryClient for InMemoryClient {
    fn simple_bind(&mut self, dn: &str, _secret: &str) -> Result<()> {
        self.state.lock().operations.push(RecordedOperation::Bind {
            uri: self.uri.clone(),
            dn: dn.to_string(),
        });
        Ok(())
    }

    fn add(&mut self, dn: &str, attrs: &Attributes) -> Result<()> {
        self.insert(dn, attrs).map(|_| ())
    }

    fn add_with_post_read(&mut self, dn: &str, attrs: &Attributes) -> Result<String> {
        self.insert(dn, attrs)
    }

    fn delete(&mut self, dn: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.operations.push(RecordedOperation::Delete {
            uri: self.uri.clone(),
            dn: dn.to_string(),
        });

        let tree = state.tree(&self.uri);
        let Some(position) = tree.iter().position(|e| e.dn.eq_ignore_ascii_case(dn)) else {
            return Ok(false);
        };
        let suffix = format!(",{}", dn.to_ascii_lowercase());
        if tree
            .iter()
            .any(|e| e.dn.to_ascii_lowercase().ends_with(&suffix))
        {
            return Err(directory_error("delete", dn, "notAllowedOnNonLeaf (66)"));
        }
        tree.remove(position);
        Ok(true)
    }

    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>> {
        let mut state = self.state.lock();
        state.operations.push(RecordedOperation::Search {
            uri: self.uri.clone(),
            base: base.to_string(),
            filter: filter.to_string(),
        });

        let tree = state.tree(&self.uri);
        if !tree.iter().any(|e| e.dn.eq_ignore_ascii_case(base)) {
            return Err(directory_error("search", base, "noSuchObject (32)"));
        }
        Ok(tree
            .iter()
            .filter(|e| in_scope(&e.dn, base, scope) && matches_filter(e, filter))
            .map(|e| project(e, attrs))
            .collect())
    }

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<()> {
        let mut state = self.state.lock();
        state.operations.push(RecordedOperation::Modify {
            uri: self.uri.clone(),
            dn: dn.to_string(),
            mods: mods.to_vec(),
        });

        let tree = state.tree(&self.uri);
        let entry = tree
            .iter_mut()
            .find(|e| e.dn.eq_ignore_ascii_case(dn))
            .ok_or_else(|| directory_error("modify", dn, "noSuchObject (32)"))?;
        for modification in mods {
            apply_modification(&mut entry.attrs, modification);
        }
        Ok(())
    }
}
