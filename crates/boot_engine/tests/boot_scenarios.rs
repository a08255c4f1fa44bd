//! Boot Scenario Tests
//!
//! Each test writes a services directory to a temp dir, boots a target and
//! checks the resulting states, reports and side effects.

mod common;

use boot_engine::{BootEngine, BootError, DependencyError, ServiceState};
use common::{fast_config, ServiceDir};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_chain_boots_in_dependency_order() {
    let dir = ServiceDir::new();
    dir.touching("a", &[])
        .touching("b", &["a"])
        .service("boot", "type = internal\ndepends-on = b\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached);
    assert_eq!(report.started, vec!["a", "b", "boot"]);
    assert!(dir.ran("a") && dir.ran("b"));
    for id in ["a", "b", "boot"] {
        assert_eq!(engine.state(id), Some(ServiceState::Started));
    }
}

#[tokio::test]
async fn test_process_chain_reaches_target() {
    let dir = ServiceDir::new();
    let b_marker = dir.marker("b.done");
    dir.service("a", "type = process\ncommand = sleep 30\n")
        .service(
            "b",
            &format!(
                "type = process\ncommand = sh -c 'touch {} && exec sleep 30'\ndepends-on = a\n",
                b_marker.display()
            ),
        )
        .service("boot", "type = internal\ndepends-on = b\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached);
    assert_eq!(report.started, vec!["a", "b", "boot"]);
    assert!(dir.ran("b"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_crashing_process_blocks_chain() {
    let dir = ServiceDir::new();
    dir.service("a", "type = process\ncommand = sh -c 'exit 1'\n")
        .service("b", "type = process\ncommand = sleep 30\ndepends-on = a\n")
        .service("boot", "type = internal\ndepends-on = b\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(!report.reached);
    assert_eq!(engine.state("b"), Some(ServiceState::Failed));
    assert_eq!(engine.state("boot"), Some(ServiceState::Failed));
    assert_eq!(engine.supervisor().spawn_count(), 1);
    assert!(engine.supervisor().running().await.is_empty());
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let dir = ServiceDir::new();
    dir.service("a", "type = scripted\ncommand = sh -c 'exit 1'\n")
        .touching("b", &["a"])
        .service("boot", "type = internal\ndepends-on = b\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(!report.reached);
    assert_eq!(report.failed_ids(), vec!["a"]);
    assert_eq!(report.blocked_ids(), vec!["b", "boot"]);
    assert!(!dir.ran("b"));
    assert_eq!(engine.supervisor().spawn_count(), 1);
    for id in ["a", "b", "boot"] {
        assert_eq!(engine.state(id), Some(ServiceState::Failed));
    }
    assert!(matches!(
        report.into_result(),
        Err(BootError::TargetUnreachable(_))
    ));
}

#[tokio::test]
async fn test_independent_services_start_concurrently() {
    let dir = ServiceDir::new();
    dir.service("slow1", "type = scripted\ncommand = sleep 1\n")
        .service("slow2", "type = scripted\ncommand = sleep 1\n")
        .service(
            "boot",
            "type = internal\ndepends-on = slow1\ndepends-on = slow2\n",
        );
    let engine = dir.engine();

    let started = Instant::now();
    let report = engine.start("boot").await.unwrap();
    let elapsed = started.elapsed();

    assert!(report.reached);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1800), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_virtual_services_spawn_nothing() {
    let dir = ServiceDir::new();
    dir.service("network", "type = internal\n")
        .service("graphical", "type = internal\ndepends-on = network\n")
        .service("boot", "type = target\ndepends-on = graphical\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached);
    assert_eq!(engine.supervisor().spawn_count(), 0);
}

#[tokio::test]
async fn test_unrelated_services_stay_stopped() {
    let dir = ServiceDir::new();
    dir.touching("a", &[])
        .touching("unrelated", &[])
        .service("boot", "type = internal\ndepends-on = a\n");
    let engine = dir.engine();

    engine.start("boot").await.unwrap();

    assert_eq!(engine.state("unrelated"), Some(ServiceState::Stopped));
    assert!(!dir.ran("unrelated"));
}

#[tokio::test]
async fn test_failure_leaves_independent_branch_running() {
    let dir = ServiceDir::new();
    dir.service("broken", "type = scripted\ncommand = sh -c 'exit 1'\n")
        .touching("needs_broken", &["broken"])
        .touching("healthy", &[])
        .service(
            "boot",
            "type = internal\ndepends-on = needs_broken\nwaits-for = healthy\n",
        );
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(!report.reached);
    assert_eq!(engine.state("healthy"), Some(ServiceState::Started));
    assert!(dir.ran("healthy"));
    assert!(!dir.ran("needs_broken"));
    for node in engine.graph().nodes() {
        assert!(node.state().is_terminal(), "{} not settled", node.id());
    }
}

#[tokio::test]
async fn test_soft_dependency_failure_does_not_block() {
    let dir = ServiceDir::new();
    dir.service("flaky", "type = scripted\ncommand = sh -c 'exit 1'\n")
        .service("boot", "type = internal\nwaits-for = flaky\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached);
    assert_eq!(engine.state("flaky"), Some(ServiceState::Failed));
    assert_eq!(report.failed_ids(), vec!["flaky"]);
}

#[tokio::test]
async fn test_after_orders_without_requiring() {
    let dir = ServiceDir::new();
    let first_marker = dir.marker("first.done");
    dir.service(
        "first",
        &format!(
            "type = scripted\ncommand = sh -c 'sleep 0.3 && touch {}'\n",
            first_marker.display()
        ),
    )
    .service(
        "second",
        &format!(
            "type = scripted\ncommand = test -f {}\nafter = first\n",
            first_marker.display()
        ),
    )
    .service(
        "boot",
        "type = internal\ndepends-on = second\ndepends-on = first\n",
    );
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached, "{}", report);
    assert_eq!(report.started, vec!["first", "second", "boot"]);
}

#[tokio::test]
async fn test_process_service_is_supervised_until_shutdown() {
    let dir = ServiceDir::new();
    dir.service("daemon", "type = process\ncommand = sleep 30\n")
        .service("boot", "type = internal\ndepends-on = daemon\n");
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();
    assert!(report.reached);

    let running = engine.supervisor().running().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].service, "daemon");

    engine.shutdown().await;
    assert!(engine.supervisor().running().await.is_empty());
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let dir = ServiceDir::new();
    dir.touching("a", &[]);
    let engine = dir.engine();
    let mut rx = engine.subscribe("a").unwrap();
    assert_eq!(*rx.borrow(), ServiceState::Stopped);

    let (report, state) = tokio::join!(engine.start("a"), async {
        rx.wait_for(|s| s.is_terminal()).await.map(|s| *s)
    });

    assert!(report.unwrap().reached);
    assert_eq!(state.unwrap(), ServiceState::Started);
}

#[tokio::test]
async fn test_yaml_and_dinit_files_mix() {
    let dir = ServiceDir::new();
    dir.touching("base", &[]).service(
        "boot.yaml",
        "type: internal\ndepends-on:\n  - base\ndescription: Boot target\n",
    );
    let engine = dir.engine();

    let report = engine.start("boot").await.unwrap();

    assert!(report.reached);
    assert!(dir.ran("base"));
}

#[tokio::test]
async fn test_boot_timeout_returns_promptly() {
    let dir = ServiceDir::new();
    dir.service("hang", "type = scripted\ncommand = sleep 30\n")
        .touching("later", &["hang"]);
    let mut config = fast_config();
    config.boot_timeout = Some(Duration::from_millis(300));
    let engine = BootEngine::from_dir(dir.services(), config).unwrap();

    let started = Instant::now();
    let err = engine.start("later").await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, BootError::TimedOut(_)));
    assert!(!dir.ran("later"));
    for id in ["hang", "later"] {
        assert_eq!(engine.state(id), Some(ServiceState::Failed));
    }
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = ServiceDir::new();
    dir.touching("a", &[]);
    let engine = dir.engine();

    engine.start("a").await.unwrap();
    assert!(matches!(engine.start("a").await, Err(BootError::AlreadyBooted)));
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let dir = ServiceDir::new();
    dir.touching("a", &[]);
    let engine = dir.engine();

    let err = engine.start("missing").await.unwrap_err();

    assert!(matches!(&err, BootError::UnknownTarget(name) if name == "missing"));
    assert_eq!(engine.supervisor().spawn_count(), 0);
}

#[test]
fn test_cycle_is_rejected_at_load() {
    let dir = ServiceDir::new();
    dir.service("a", "type = internal\ndepends-on = b\n")
        .service("b", "type = internal\nwaits-for = a\n");

    let err = BootEngine::from_dir(dir.services(), fast_config()).unwrap_err();

    match err {
        BootError::Dependency(DependencyError::Cycle(members)) => {
            assert_eq!(members, vec!["a", "b"]);
        }
        other => panic!("expected a cycle, got {}", other),
    }
}

#[test]
fn test_unresolved_dependency_is_named() {
    let dir = ServiceDir::new();
    dir.service("a", "type = internal\ndepends-on = ghost\n");

    let err = BootEngine::from_dir(dir.services(), fast_config()).unwrap_err();

    assert!(matches!(
        &err,
        BootError::Dependency(DependencyError::UnresolvedDependency { service, dependency })
            if service == "a" && dependency == "ghost"
    ));
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_malformed_file_is_rejected_at_load() {
    let dir = ServiceDir::new();
    dir.service("bad", "type = process\nthis line has no separator\n");

    let err = BootEngine::from_dir(dir.services(), fast_config()).unwrap_err();

    assert!(matches!(err, BootError::Load(_)));
}
