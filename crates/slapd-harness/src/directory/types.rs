//! Value types exchanged with a directory client.

use std::collections::BTreeMap;

/// Attribute/value pairs of an entry, in the order they are sent.
pub type Attributes = Vec<(String, Vec<String>)>;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

/// One entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Values of `attr`, matched case-insensitively.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }
}

/// A single change within a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Add(String, Vec<String>),
    Replace(String, Vec<String>),
    Delete(String, Vec<String>),
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add(attr, _)
            | Modification::Replace(attr, _)
            | Modification::Delete(attr, _) => attr,
        }
    }
}

/// Strip the `{n}` ordering prefix cn=config puts on ordered values and RDNs.
pub fn strip_ordering_prefix(value: &str) -> &str {
    if value.starts_with('{') {
        if let Some(end) = value.find('}') {
            return &value[end + 1..];
        }
    }
    value
}
