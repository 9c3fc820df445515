//! Connection lifecycle: retries, error-class call handling, enable/disable
//! and reconfiguration.

mod common;

use common::*;
use hs_bridge_core::ConnState;
use hs_bridge_sdk::{BridgeError, ConnectionConfig, HsRef, HsValue, NodeTree, Row, TreeValue};
use hs_bridge_sim::{Counters, SimFault, SimServer};
use std::time::Duration;

#[tokio::test]
async fn retries_until_connected() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    sim.fail_connects(3);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    assert_eq!(sim.counters().connects, 1);

    let status = h.tree.child(h.instance.root(), "Status").expect("status node");
    wait_until("status text", || {
        h.tree.value(&status) == Some(TreeValue::String("Connected".into()))
    })
    .await;
}

#[tokio::test]
async fn connect_failure_is_reported_in_status() {
    let sim = SimServer::new();
    sim.fail_connects(u32::MAX);
    let h = start_instance(&sim, test_config());
    let status = h.tree.child(h.instance.root(), "Status").expect("status node");
    wait_until("error text", || {
        matches!(
            h.tree.value(&status),
            Some(TreeValue::String(text)) if text.starts_with("unable to connect")
        )
    })
    .await;
    assert!(h.instance.manager().last_error().is_some());
}

#[tokio::test]
async fn permission_error_retried_exactly_once() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    assert_eq!(sim.counters().connects, 1);

    // One permission failure: reconnect, retry, succeed.
    sim.inject_fault("read", SimFault::Permission);
    let grid = h.instance.read("point", None).await.expect("retried read");
    assert_eq!(grid.len(), 1);
    assert_eq!(sim.counters().connects, 2);

    // Two in a row: the single retry fails too and the error surfaces.
    sim.inject_fault("read", SimFault::Permission);
    sim.inject_fault("read", SimFault::Permission);
    let err = h.instance.read("point", None).await.expect_err("surfaced");
    assert!(err.is_permission());
}

#[tokio::test]
async fn redirect_is_retried_transparently() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;

    sim.inject_fault("read", SimFault::Redirect);
    let grid = h.instance.read("point", None).await.expect("retried read");
    assert_eq!(grid.len(), 1);
    assert_eq!(sim.counters().connects, 2);
}

#[tokio::test]
async fn consecutive_redirects_never_surface() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;

    // Unlike permission errors, redirects keep retrying until one resolves.
    sim.inject_fault("read", SimFault::Redirect);
    sim.inject_fault("read", SimFault::Redirect);
    let grid = h.instance.read("point", None).await.expect("retried read");
    assert_eq!(grid.len(), 1);
    assert_eq!(sim.counters().connects, 3);
}

#[tokio::test]
async fn transport_error_surfaces_and_reconnects() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;

    sim.inject_fault("read", SimFault::Network);
    let err = h.instance.read("point", None).await.expect_err("surfaced");
    assert!(err.is_transport());
    wait_until("reconnect", || sim.counters().connects == 2).await;
}

#[tokio::test]
async fn disabled_instance_refuses_without_io() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let config = ConnectionConfig {
        enabled: false,
        ..test_config()
    };
    let h = start_instance(&sim, config);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = h.instance.read("point", None).await.expect_err("disabled");
    assert!(matches!(err, BridgeError::Disabled));
    assert_eq!(sim.counters(), Counters::default());

    let status = h.tree.child(h.instance.root(), "Status").expect("status node");
    assert_eq!(
        h.tree.value(&status),
        Some(TreeValue::String("Disabled".into()))
    );
}

#[tokio::test]
async fn stopped_instance_refuses_new_work() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    h.instance.stop().await;

    let err = h.instance.read("point", None).await.expect_err("stopped");
    assert!(matches!(err, BridgeError::Disabled));

    // Demand events after stop produce no traffic.
    let before = sim.counters();
    h.tree
        .subscribe_value(&format!("{}/site.a/p.temp/curVal", h.instance.root()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.counters(), before);
}

#[tokio::test]
async fn edit_connection_rebuilds_navigated_tree() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let root = h.instance.root().clone();
    wait_until("first sync", || h.tree.child(&root, "site.a").is_some()).await;

    // The remote hierarchy changes while we reconfigure; the rebuilt subtree
    // must reflect the new listing, not the cached one.
    sim.seed_nav(
        None,
        vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("site.b")))
            .with("dis", HsValue::str("Site B"))],
    );
    h.instance
        .edit_connection(test_config())
        .await
        .expect("edit");
    wait_until("resync", || h.tree.child(&root, "site.b").is_some()).await;
    assert!(h.tree.child(&root, "site.a").is_none());
    assert!(h.tree.child(&root, "Status").is_some());
    assert_eq!(sim.counters().connects, 2);
}

#[tokio::test]
async fn edit_connection_can_disable() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;

    let disabled = ConnectionConfig {
        enabled: false,
        ..test_config()
    };
    h.instance.edit_connection(disabled).await.expect("edit");
    let mut rx = h.instance.manager().state();
    assert_eq!(*rx.borrow_and_update(), ConnState::Disconnected);

    let err = h.instance.read("point", None).await.expect_err("disabled");
    assert!(matches!(err, BridgeError::Disabled));
    assert_eq!(sim.counters().connects, 1);
}

#[tokio::test]
async fn blank_password_keeps_stored_secret() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let mut config = test_config();
    config.password = "secret".into();
    let h = start_instance(&sim, config);
    wait_connected(&h).await;

    let mut edited = test_config();
    edited.password = String::new();
    h.instance.edit_connection(edited).await.expect("edit");
    assert_eq!(h.instance.manager().config().password, "secret");
}
