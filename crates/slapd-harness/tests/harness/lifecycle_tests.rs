use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use slapd_harness::{ConfigMode, HarnessError, Schema};
use test_log::test;

use super::test_utilities::{TestHarness, invocations, process_exists};

#[test]
fn test_start_and_stop() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();

    server.start(None).unwrap();
    assert!(server.is_running());
    let pid = server.pid().expect("pid reported by handshake");
    assert!(process_exists(pid));

    let urls: Vec<&str> = server.listeners().iter().map(|l| l.url.as_str()).collect();
    assert_eq!(urls, vec!["ldapi://socket", "ldap://localhost:0"]);

    let log = fs::read_to_string(server.log_path()).unwrap();
    assert!(log.contains(&format!("starting server {}", server.token())));
    assert!(log.contains(&format!("fake server {pid} ready")));

    server.stop().unwrap();
    assert!(!server.is_running());
    assert_eq!(server.pid(), None);
    assert!(server.listeners().is_empty());
    assert!(!process_exists(pid));

    // Stopping again is harmless
    server.stop().unwrap();
}

#[test]
fn test_start_twice_reports_already_running() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    server.start(None).unwrap();

    let result = server.start(None);
    assert!(matches!(result, Err(HarnessError::AlreadyRunning { .. })));
    assert!(server.is_running());
}

#[test]
fn test_restart_after_stop() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();

    server.start(None).unwrap();
    let first = server.pid().unwrap();
    server.stop().unwrap();
    server.start(None).unwrap();
    let second = server.pid().unwrap();
    assert_ne!(first, second);

    let log = fs::read_to_string(server.log_path()).unwrap();
    assert_eq!(log.matches("==== ").count(), 2);

    // Configuration was synthesized only once
    let seeds = invocations(server.home())
        .iter()
        .filter(|line| line.starts_with("-T add"))
        .count();
    assert_eq!(seeds, 1);
}

#[test]
fn test_invocation_arguments() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    server.start(Some(3890)).unwrap();
    assert_eq!(server.port(), 3890);

    let config = server.config_path();
    let config = config.display();
    assert_eq!(
        invocations(server.home()),
        vec![
            format!("-T add -d 0 -n0 -F {config}"),
            format!("-T test -d 0 -F {config}"),
            format!("-d 0 -F {config} -h ldapi://socket ldap://localhost:3890"),
        ]
    );
}

#[test]
fn test_structured_config_synthesized_once() {
    let mut harness = TestHarness::new();
    let server = harness.pool.new_server().unwrap();

    assert!(server.synthesize_config(&[Schema::from("core")]).unwrap());
    assert!(!server.synthesize_config(&[Schema::from("cosine")]).unwrap());

    let seed = fs::read_to_string(server.config_path().join("seed.ldif")).unwrap();
    assert!(seed.contains(&format!("olcBkHarnessIdentifier: {}", server.token())));
    assert!(seed.contains(&format!(
        "olcBkHarnessPort: {}",
        harness.pool.channel().port()
    )));
    assert!(seed.contains(&format!("olcRootPW: {}", server.secret())));
    assert!(seed.contains("include: file:///src/servers/slapd/schema/core.ldif"));
    assert!(!seed.contains("cosine"));
}

#[test]
fn test_flat_mode_lifecycle() {
    let mut harness = TestHarness::new();
    let mut server = harness
        .pool
        .new_server_with(
            ConfigMode::Flat,
            Some(vec![Schema::from("core"), Path::new("/opt/extra.schema").to_path_buf().into()]),
        )
        .unwrap();

    server.start(None).unwrap();
    let conf = fs::read_to_string(server.config_path()).unwrap();
    assert!(conf.contains(&format!("identifier {}", server.token())));
    assert!(conf.contains("include /src/servers/slapd/schema/core.schema"));
    assert!(conf.contains("include /opt/extra.schema"));
    assert!(invocations(server.home())[0].starts_with("-T test -d 0 -f "));

    let result = server.load_module(Path::new("/build/servers/slapd/overlays/syncprov"));
    assert!(matches!(result, Err(HarnessError::UnsupportedMode { .. })));
    let result = server.set_server_id(1);
    assert!(matches!(result, Err(HarnessError::UnsupportedMode { .. })));
}

#[test]
fn test_validation_failure_carries_diagnostics() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    fs::write(
        server.home().join("fail-validate"),
        "olcSuffix: value #0 invalid per syntax\n",
    )
    .unwrap();

    match server.start(None) {
        Err(HarnessError::Config { diagnostics, .. }) => {
            assert!(diagnostics.contains("olcSuffix: value #0 invalid per syntax"));
        }
        other => panic!("Expected config error, got {other:?}"),
    }
    assert!(!server.is_running());
    // Never launched
    assert_eq!(invocations(server.home()).len(), 2);
}

#[test]
fn test_early_exit_reports_log_tail() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    fs::write(server.home().join("exit-early"), "").unwrap();

    let started = Instant::now();
    match server.start(None) {
        Err(HarnessError::StartupFailed { diagnostics, .. }) => {
            assert!(diagnostics.contains("cannot open database"));
        }
        other => panic!("Expected startup failure, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!server.is_running());
}

#[test]
fn test_stream_closed_before_ready() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    fs::write(server.home().join("close-early"), "").unwrap();

    let result = server.start(None);
    assert!(matches!(result, Err(HarnessError::StartupFailed { .. })));
    assert!(!server.is_running());
    assert_eq!(server.pid(), None);
}

#[test]
fn test_foreign_token_is_protocol_error() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    fs::write(server.home().join("wrong-token"), "").unwrap();

    let result = server.start(None);
    assert!(matches!(result, Err(HarnessError::Protocol { .. })));
    assert!(!server.is_running());
    assert!(!harness.pool.channel().is_pending(server.token()));
}

#[test]
fn test_drop_stops_server() {
    let mut harness = TestHarness::new();
    let mut server = harness.pool.new_server().unwrap();
    server.start(None).unwrap();
    let pid = server.pid().unwrap();
    let home = server.home().to_path_buf();

    drop(server);
    assert!(!process_exists(pid));
    assert!(!home.exists());
}

#[test]
fn test_sequential_servers_share_channel() {
    let mut harness = TestHarness::new();
    let mut first = harness.pool.new_server().unwrap();
    let mut second = harness.pool.new_server().unwrap();

    first.start(None).unwrap();
    second.start(None).unwrap();
    assert_ne!(first.pid(), second.pid());
    assert_ne!(first.uri(), second.uri());
    assert_eq!(harness.pool.servers().len(), 2);
}
