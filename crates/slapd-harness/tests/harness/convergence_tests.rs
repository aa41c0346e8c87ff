use std::time::{Duration, Instant};

use slapd_harness::{ConvergenceWaiter, HarnessError, Mesh, MeshSpec};
use test_log::test;

use super::test_utilities::{TestHarness, fake_checker};

fn uris() -> Vec<String> {
    vec!["ldapi://a".to_string(), "ldapi://b".to_string()]
}

#[test]
fn test_converged_servers() {
    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-pass"), Duration::from_secs(1));
    waiter
        .wait_for_convergence("dc=example,dc=com", &uris(), Duration::from_secs(5))
        .unwrap();
}

#[test]
fn test_checker_failure_carries_stderr() {
    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-fail"), Duration::from_secs(1));
    let result = waiter.wait_for_convergence("dc=example,dc=com", &uris(), Duration::from_secs(5));

    match result {
        Err(HarnessError::ConvergenceTimeout { base, uris, reason }) => {
            assert_eq!(base, "dc=example,dc=com");
            assert_eq!(uris.len(), 2);
            assert!(reason.contains("entries differ on ldapi://a"), "{reason}");
        }
        other => panic!("Expected convergence failure, got {other:?}"),
    }
}

#[test]
fn test_checker_arguments() {
    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-echo"), Duration::from_secs(1));
    let result = waiter.wait_for_convergence("dc=example,dc=com", &uris(), Duration::from_secs(2));

    match result {
        Err(HarnessError::ConvergenceTimeout { reason, .. }) => {
            assert!(
                reason.contains("args: -p --base dc=example,dc=com --timeout 2 ldapi://a ldapi://b"),
                "{reason}"
            );
        }
        other => panic!("Expected convergence failure, got {other:?}"),
    }
}

#[test]
fn test_overrunning_checker_is_killed() {
    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-hang"), Duration::from_millis(200));
    let started = Instant::now();
    let result = waiter.wait_for_convergence("dc=example,dc=com", &uris(), Duration::from_secs(1));

    assert!(matches!(result, Err(HarnessError::ConvergenceTimeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_forking_checker_is_killed_within_bound() {
    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-wrapper"), Duration::from_millis(200));
    let started = Instant::now();
    let result = waiter.wait_for_convergence("dc=example,dc=com", &uris(), Duration::from_secs(1));
    let elapsed = started.elapsed();

    match result {
        Err(HarnessError::ConvergenceTimeout { reason, .. }) => {
            assert!(reason.contains("checking ldapi://a"), "{reason}");
        }
        other => panic!("Expected convergence failure, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(3), "waited {elapsed:?}");
}

#[test]
fn test_mesh_convergence_uses_every_uri() {
    let mut harness = TestHarness::new();
    let spec = MeshSpec {
        count: 2,
        ..MeshSpec::default()
    };
    let mesh = Mesh::build(&mut harness.pool, spec).unwrap();

    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-echo"), Duration::from_secs(1));
    match mesh.wait_for_convergence(&waiter, Duration::from_secs(3)) {
        Err(HarnessError::ConvergenceTimeout { uris, reason, .. }) => {
            assert_eq!(uris, mesh.uris());
            for uri in mesh.uris() {
                assert!(reason.contains(&uri));
            }
        }
        other => panic!("Expected convergence failure, got {other:?}"),
    }

    let waiter = ConvergenceWaiter::new(fake_checker("synccheck-pass"), Duration::from_secs(1));
    waiter
        .wait_for_servers(mesh.suffix(), mesh.servers().map(|(_, s)| s), Duration::from_secs(3))
        .unwrap();
}
