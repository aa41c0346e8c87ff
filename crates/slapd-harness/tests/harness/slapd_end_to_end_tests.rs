// Run against a real OpenLDAP build when TOP_SRCDIR/TOP_BUILDDIR point at one;
// skipped otherwise.

use std::collections::BTreeSet;
use std::time::Duration;

use slapd_harness::directory::SearchScope;
use slapd_harness::{BackendKind, ConvergenceWaiter, Database, DirectoryClient, Mesh, MeshSpec};
use test_log::test;

use super::test_utilities::{find_on_path, real_slapd_pool};

const SUFFIX: &str = "dc=example,dc=com";
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

fn base_entry() -> Vec<(String, Vec<String>)> {
    vec![
        (
            "objectClass".to_string(),
            vec![
                "organization".to_string(),
                "domainRelatedObject".to_string(),
                "dcObject".to_string(),
            ],
        ),
        ("o".to_string(), vec!["Example, Inc.".to_string()]),
        ("associatedDomain".to_string(), vec!["example.com".to_string()]),
    ]
}

fn device_entry(server_id: u32) -> Vec<(String, Vec<String>)> {
    vec![
        ("objectClass".to_string(), vec!["device".to_string()]),
        (
            "description".to_string(),
            vec![format!("Entry created on serverid {server_id}")],
        ),
    ]
}

/// Every DN under the suffix, without attributes.
fn subtree_dns(client: &mut dyn DirectoryClient) -> BTreeSet<String> {
    client
        .search(SUFFIX, SearchScope::Subtree, "(objectClass=*)", &["1.1"])
        .unwrap()
        .into_iter()
        .map(|entry| entry.dn)
        .collect()
}

#[test]
fn test_mdb_database_round_trip() {
    let Some((mut pool, _config, _workdir)) = real_slapd_pool() else {
        return;
    };
    let mut server = pool.new_server().unwrap();
    server.start(None).unwrap();
    assert!(!server.listeners().is_empty());

    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    assert!(database.dn().starts_with("olcDatabase={"));
    assert!(database.dn().ends_with("}mdb,cn=config"));

    let mut client = server.connect().unwrap();
    client.simple_bind(database.root_dn(), database.secret()).unwrap();
    client.add(SUFFIX, &base_entry()).unwrap();

    assert_eq!(subtree_dns(client.as_mut()), BTreeSet::from([SUFFIX.to_string()]));

    server.stop().unwrap();
}

#[test]
fn test_two_node_mesh_converges() {
    let Some((mut pool, config, _workdir)) = real_slapd_pool() else {
        return;
    };
    let Some(checker) = find_on_path(&config.convergence_checker.to_string_lossy()) else {
        eprintln!("Skipping: convergence checker not found");
        return;
    };

    let spec = MeshSpec {
        count: 2,
        backend: BackendKind::Mdb {
            max_size: config.mdb_max_size,
        },
        ..MeshSpec::default()
    };
    let mesh = Mesh::build(&mut pool, spec).unwrap();
    let waiter = ConvergenceWaiter::new(checker, config.teardown_grace());

    let mut expected = BTreeSet::new();
    let mut clients = Vec::new();
    for (id, server) in mesh.servers() {
        let database = mesh.database(id).unwrap();
        let mut client = server.connect().unwrap();
        client.simple_bind(database.root_dn(), database.secret()).unwrap();

        if expected.is_empty() {
            client.add(SUFFIX, &base_entry()).unwrap();
            expected.insert(SUFFIX.to_string());
            mesh.wait_for_convergence(&waiter, CONVERGENCE_TIMEOUT).unwrap();
        }

        let dn = format!("cn=entry{id},{SUFFIX}");
        client.add(&dn, &device_entry(id)).unwrap();
        expected.insert(dn);
        clients.push((id, client));
    }

    mesh.wait_for_convergence(&waiter, CONVERGENCE_TIMEOUT).unwrap();

    for (id, mut client) in clients {
        assert_eq!(subtree_dns(client.as_mut()), expected, "server {id}");
    }

    mesh.shutdown().unwrap();
}
