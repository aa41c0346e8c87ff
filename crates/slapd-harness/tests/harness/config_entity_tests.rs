use std::path::Path;

use slapd_harness::directory::memory::RecordedOperation;
use slapd_harness::directory::{DirectoryEntry, Modification};
use slapd_harness::{
    BackendKind, Database, HarnessError, InMemoryDirectory, Overlay, OverlayKind, OverlayPosition,
};
use test_log::test;

use super::test_utilities::TestHarness;

const SUFFIX: &str = "dc=example,dc=com";

fn adds(operations: &[RecordedOperation]) -> Vec<&str> {
    operations
        .iter()
        .filter_map(|op| match op {
            RecordedOperation::Add { dn, .. } => Some(dn.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_database_create_registers_suffix() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();

    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    assert_eq!(database.dn(), "olcDatabase={1}mdb,cn=config");
    assert_eq!(database.root_dn(), SUFFIX);
    assert_ne!(database.secret(), server.secret());

    let storage = database.storage().expect("mdb gets a storage directory");
    assert!(storage.is_dir());
    assert!(storage.starts_with(server.home()));

    let record = server.suffix(SUFFIX).unwrap();
    assert_eq!(record.dn, database.dn());
    assert_eq!(record.secret, database.secret());

    let entry = harness.directory.entry(&server.uri(), database.dn()).unwrap();
    assert_eq!(entry.values("olcSuffix"), [SUFFIX.to_string()]);
    assert_eq!(entry.values("olcDbMaxSize"), ["10737418240".to_string()]);
    assert_eq!(
        entry.values("olcDbDirectory"),
        [storage.display().to_string()]
    );

    let binds: Vec<_> = harness
        .directory
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOperation::Bind { dn, .. } => Some(dn),
            _ => None,
        })
        .collect();
    assert_eq!(binds, vec!["cn=config".to_string()]);
}

#[test]
fn test_duplicate_suffix_rejected_without_request() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    let before = harness.directory.operations().len();

    let result = Database::create(&mut server, "DC=Example,DC=Com", BackendKind::default(), Vec::new());
    assert!(matches!(result, Err(HarnessError::DuplicateSuffix { .. })));
    assert_eq!(harness.directory.operations().len(), before);
    assert_eq!(server.suffixes().len(), 1);
}

#[test]
fn test_ldap_backend_database() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();

    let backend = BackendKind::ldap(["ldap://a.example:389", "ldap://b.example:389"]);
    let extra = vec![("olcDbIDAssertBind".to_string(), vec!["bindmethod=none".to_string()])];
    let database = Database::create(&mut server, "o=proxy", backend, extra).unwrap();

    assert_eq!(database.dn(), "olcDatabase={1}ldap,cn=config");
    assert!(database.storage().is_none());
    let entry = harness.directory.entry(&server.uri(), database.dn()).unwrap();
    assert_eq!(
        entry.values("olcDbURI"),
        ["ldap://a.example:389 ldap://b.example:389".to_string()]
    );
    assert_eq!(entry.values("olcDbIDAssertBind"), ["bindmethod=none".to_string()]);
}

#[test]
fn test_database_delete() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    let dn = database.dn().to_string();
    let storage = database.storage().unwrap().to_path_buf();

    database.delete(&mut server).unwrap();
    assert!(!server.has_suffix(SUFFIX));
    assert!(harness.directory.entry(&server.uri(), &dn).is_none());
    assert!(!storage.exists());

    // The suffix can be reused once deleted
    Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
}

#[test]
fn test_delete_of_vanished_database_succeeds() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();

    server
        .admin_client()
        .unwrap()
        .delete(database.dn())
        .unwrap();
    database.delete(&mut server).unwrap();
    assert!(server.suffixes().is_empty());
}

#[test]
fn test_overlay_at_position_not_implemented() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    let before = harness.directory.operations().len();

    let result = Overlay::create(
        &server,
        &database,
        OverlayKind::syncprov(),
        OverlayPosition::At(0),
    );
    assert!(matches!(result, Err(HarnessError::NotImplemented { .. })));
    assert_eq!(harness.directory.operations().len(), before);
}

#[test]
fn test_unnamed_overlay_rejected_before_any_request() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    let database = Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    let before = harness.directory.operations().len();

    assert!(matches!(
        OverlayKind::from_module("/", "olcAccessLogConfig"),
        Err(HarnessError::Config { .. })
    ));
    let result = Overlay::create(
        &server,
        &database,
        OverlayKind::new("", "olcAccessLogConfig"),
        OverlayPosition::Append,
    );
    assert!(matches!(result, Err(HarnessError::Config { .. })));
    assert_eq!(harness.directory.operations().len(), before);
}

#[test]
fn test_overlay_loads_module_then_creates_entry() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    let mut database =
        Database::create(&mut server, SUFFIX, BackendKind::default(), Vec::new()).unwrap();
    harness.directory.clear_operations();

    let overlay = Overlay::create(
        &server,
        &database,
        OverlayKind::syncprov(),
        OverlayPosition::Append,
    )
    .unwrap();
    assert_eq!(overlay.dn(), "olcOverlay={0}syncprov,olcDatabase={1}mdb,cn=config");
    assert_eq!(overlay.database_dn(), database.dn());
    database.push_overlay(overlay);
    assert_eq!(database.overlays().len(), 1);

    assert_eq!(
        adds(&harness.directory.operations()),
        vec![
            "cn=module,cn=config",
            "olcOverlay=syncprov,olcDatabase={1}mdb,cn=config",
        ]
    );
    let modules = harness
        .directory
        .entry(&server.uri(), "cn=module{0},cn=config")
        .unwrap();
    assert_eq!(
        modules.values("olcModuleLoad"),
        ["/build/servers/slapd/overlays/syncprov".to_string()]
    );

    // A second database reuses the loaded module
    let other = Database::create(&mut server, "o=other", BackendKind::default(), Vec::new()).unwrap();
    harness.directory.clear_operations();
    Overlay::create(&server, &other, OverlayKind::syncprov(), OverlayPosition::Append).unwrap();
    assert_eq!(
        adds(&harness.directory.operations()),
        vec!["olcOverlay=syncprov,olcDatabase={2}mdb,cn=config"]
    );
}

#[test]
fn test_overlay_on_foreign_database_rejected() {
    let mut harness = TestHarness::new();
    let mut first = harness.pool.new_server().unwrap();
    let second = harness.pool.new_server().unwrap();
    let database = Database::create(&mut first, SUFFIX, BackendKind::default(), Vec::new()).unwrap();

    let result = Overlay::create(
        &second,
        &database,
        OverlayKind::syncprov(),
        OverlayPosition::Append,
    );
    assert!(matches!(result, Err(HarnessError::Config { .. })));
}

#[test]
fn test_load_module_appends_to_existing_list() {
    let mut module_list = DirectoryEntry::new("cn=module{0},cn=config");
    module_list.attrs.insert(
        "objectClass".to_string(),
        vec!["olcModuleList".to_string()],
    );
    module_list.attrs.insert(
        "olcModuleLoad".to_string(),
        vec!["{0}/build/tests/modules/mod-harness/mod_harness".to_string()],
    );
    let mut harness = TestHarness::with_directory(InMemoryDirectory::new().with_seed_entry(module_list));
    let server = harness.pool.new_server().unwrap();

    server
        .load_module(Path::new("/build/servers/slapd/overlays/syncprov.la"))
        .unwrap();
    let modifies: Vec<_> = harness
        .directory
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOperation::Modify { dn, mods, .. } => Some((dn, mods)),
            _ => None,
        })
        .collect();
    assert_eq!(
        modifies,
        vec![(
            "cn=module{0},cn=config".to_string(),
            vec![Modification::Add(
                "olcModuleLoad".to_string(),
                vec!["/build/servers/slapd/overlays/syncprov.la".to_string()]
            )]
        )]
    );

    // Same base name under a different path is already loaded
    harness.directory.clear_operations();
    server
        .load_module(Path::new("/usr/lib/openldap/syncprov.so"))
        .unwrap();
    assert!(adds(&harness.directory.operations()).is_empty());
    assert!(
        !harness
            .directory
            .operations()
            .iter()
            .any(|op| matches!(op, RecordedOperation::Modify { .. }))
    );

    let modules = harness
        .directory
        .entry(&server.uri(), "cn=module{0},cn=config")
        .unwrap();
    assert_eq!(modules.values("olcModuleLoad").len(), 2);
}

#[test]
fn test_set_server_id() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();

    server.set_server_id(7).unwrap();
    assert_eq!(server.server_id(), Some(7));
    let config = harness.directory.entry(&server.uri(), "cn=config").unwrap();
    assert_eq!(config.values("olcServerID"), ["7".to_string()]);
}
