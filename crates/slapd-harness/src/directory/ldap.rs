//! [`DirectoryClient`] backed by the synchronous `ldap3` connection.

use super::types::{Attributes, DirectoryEntry, Modification, SearchScope};
use super::{DirectoryClient, DirectoryConnector};
use crate::error::{HarnessError, Result};
use ldap3::asn1::parse_tag;
use ldap3::controls::{Control, ControlType, PostRead, RawControl};
use ldap3::{LdapConn, LdapResult, Mod, Scope, SearchEntry};
use log::{debug, trace};
use std::collections::HashSet;

const POST_READ_RESPONSE_OID: &str = "1.3.6.1.1.13.2";
const NO_SUCH_OBJECT: u32 = 32;

/// Opens real LDAP connections (ldap://, ldapi://).
#[derive(Debug, Default, Clone, Copy)]
pub struct LdapDirectory;

impl DirectoryConnector for LdapDirectory {
    fn connect(&self, uri: &str) -> Result<Box<dyn DirectoryClient>> {
        let conn = LdapConn::new(uri)
            .map_err(|e| HarnessError::from_directory_error(e, &format!("connect {uri}")))?;
        debug!("Connected to {uri}");
        Ok(Box::new(LdapClient {
            conn,
            uri: uri.to_string(),
        }))
    }
}

pub struct LdapClient {
    conn: LdapConn,
    uri: String,
}

impl LdapClient {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

fn to_value_set(values: &[String]) -> HashSet<String> {
    values.iter().cloned().collect()
}

fn to_add_request(attrs: &Attributes) -> Vec<(String, HashSet<String>)> {
    attrs
        .iter()
        .map(|(attr, values)| (attr.clone(), to_value_set(values)))
        .collect()
}

fn to_mod(modification: &Modification) -> Mod<String> {
    match modification {
        Modification::Add(attr, values) => Mod::Add(attr.clone(), to_value_set(values)),
        Modification::Replace(attr, values) => Mod::Replace(attr.clone(), to_value_set(values)),
        Modification::Delete(attr, values) => Mod::Delete(attr.clone(), to_value_set(values)),
    }
}

fn to_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

/// Extract the entry DN from a post-read response value.
///
/// The value is an encoded SearchResultEntry: `[APPLICATION 4] { dn, attrs }`.
fn post_read_dn(raw: &RawControl) -> Result<String> {
    let protocol_error = |reason: &str| HarnessError::Protocol {
        context: "post-read control".to_string(),
        reason: reason.to_string(),
    };

    let value = raw
        .val
        .as_deref()
        .ok_or_else(|| protocol_error("response control carries no value"))?;
    let (_, tag) = parse_tag(value)
        .map_err(|e| protocol_error(&format!("undecodable response value: {e:?}")))?;
    let dn = tag
        .match_id(4)
        .and_then(|t| t.expect_constructed())
        .and_then(|parts| parts.into_iter().next())
        .and_then(|t| t.expect_primitive())
        .ok_or_else(|| protocol_error("response value is not a search entry"))?;

    String::from_utf8(dn).map_err(|e| protocol_error(&format!("entry DN is not UTF-8: {e}")))
}

fn find_post_read(result: &LdapResult) -> Option<&RawControl> {
    result.ctrls.iter().find_map(|Control(kind, raw)| {
        let matches =
            matches!(kind, Some(ControlType::PostReadResp)) || raw.ctype == POST_READ_RESPONSE_OID;
        matches.then_some(raw)
    })
}

impl DirectoryClient for LdapClient {
    fn simple_bind(&mut self, dn: &str, secret: &str) -> Result<()> {
        self.conn
            .simple_bind(dn, secret)
            .and_then(|r| r.success())
            .map_err(|e| HarnessError::from_directory_error(e, &format!("bind as {dn}")))?;
        Ok(())
    }

    fn add(&mut self, dn: &str, attrs: &Attributes) -> Result<()> {
        trace!("add {dn} ({} attributes)", attrs.len());
        self.conn
            .add(dn, to_add_request(attrs))
            .and_then(|r| r.success())
            .map_err(|e| HarnessError::from_directory_error(e, &format!("add {dn}")))?;
        Ok(())
    }

    fn add_with_post_read(&mut self, dn: &str, attrs: &Attributes) -> Result<String> {
        let mut control = PostRead::new(Vec::<&str>::new());
        control.crit = true;

        let result = self
            .conn
            .with_controls(control)
            .add(dn, to_add_request(attrs))
            .and_then(|r| r.success())
            .map_err(|e| HarnessError::from_directory_error(e, &format!("add {dn}")))?;

        let raw = find_post_read(&result).ok_or_else(|| HarnessError::Protocol {
            context: "post-read control".to_string(),
            reason: format!("server returned no post-read response for {dn}"),
        })?;
        let stored = post_read_dn(raw)?;
        trace!("add {dn} stored as {stored}");
        Ok(stored)
    }

    fn delete(&mut self, dn: &str) -> Result<bool> {
        let result = self
            .conn
            .delete(dn)
            .map_err(|e| HarnessError::from_directory_error(e, &format!("delete {dn}")))?;
        if result.rc == NO_SUCH_OBJECT {
            return Ok(false);
        }
        result
            .success()
            .map_err(|e| HarnessError::from_directory_error(e, &format!("delete {dn}")))?;
        Ok(true)
    }

    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>> {
        let (entries, _) = self
            .conn
            .search(base, to_scope(scope), filter, attrs.to_vec())
            .and_then(|r| r.success())
            .map_err(|e| HarnessError::from_directory_error(e, &format!("search {base}")))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                DirectoryEntry {
                    dn: entry.dn,
                    attrs: entry.attrs.into_iter().collect(),
                }
            })
            .collect())
    }

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<()> {
        self.conn
            .modify(dn, mods.iter().map(to_mod).collect())
            .and_then(|r| r.success())
            .map_err(|e| HarnessError::from_directory_error(e, &format!("modify {dn}")))?;
        Ok(())
    }
}

impl Drop for LdapClient {
    fn drop(&mut self) {
        let _ = self.conn.unbind();
    }
}
