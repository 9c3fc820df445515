//! Subscription multiplexing and change polling.

mod common;

use common::*;
use hs_bridge_core::ConnState;
use hs_bridge_sdk::{HsRef, HsValue, NodePath, NodeTree, TreeValue};
use hs_bridge_sim::{SimFault, SimServer};
use std::{collections::HashSet, sync::Arc, time::Duration};

#[tokio::test]
async fn degrades_without_watch_support() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    sim.advertise_watch(false);
    let h = start_instance(&sim, test_config());

    let mut rx = h.instance.manager().state();
    {
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s != ConnState::Disconnected),
        )
        .await
        .expect("timeout")
        .expect("state channel");
        assert_eq!(*state, ConnState::Connected { watch: false });
    }

    // Local interest is accepted but produces no watch traffic and no polls.
    let owner: NodePath = Arc::from("/srv/site.a/p.temp");
    h.instance
        .subscriptions()
        .subscribe(HsRef::new("p.temp"), owner)
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let counters = sim.counters();
    assert_eq!(counters.watch_opens, 0);
    assert_eq!(counters.sub_calls, 0);
    assert_eq!(counters.poll_calls, 0);
    assert_eq!(h.instance.subscriptions().snapshot().len(), 1);
}

#[tokio::test]
async fn debounce_coalesces_watch_traffic() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let mux = h.instance.subscriptions();
    let id = HsRef::new("p.temp");
    let owner: NodePath = Arc::from("/srv/site.a/p.temp");

    // Subscribe and unsubscribe inside one window cancel to zero calls.
    mux.subscribe(id.clone(), owner.clone()).await;
    mux.unsubscribe(id.clone(), owner.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.counters().sub_calls, 0);
    assert_eq!(sim.counters().unsub_calls, 0);

    // Three owners of one id in one window produce one subscribe call.
    for suffix in ["a", "b", "c"] {
        let owner: NodePath = Arc::from(format!("/srv/node-{suffix}"));
        mux.subscribe(id.clone(), owner).await;
    }
    wait_until("subscribe flush", || sim.counters().sub_calls == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.counters().sub_calls, 1);
    assert!(sim.subscribed_ids().contains(&id));

    // Interest survives until the last owner drops; then one unsubscribe.
    for suffix in ["a", "b"] {
        let owner: NodePath = Arc::from(format!("/srv/node-{suffix}"));
        mux.unsubscribe(id.clone(), owner).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.counters().unsub_calls, 0);
    mux.unsubscribe(id.clone(), Arc::from("/srv/node-c")).await;
    wait_until("unsubscribe flush", || sim.counters().unsub_calls == 1).await;
    assert!(!sim.subscribed_ids().contains(&id));
}

#[tokio::test]
async fn unsubscribes_flush_before_subscribes() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let mux = h.instance.subscriptions();
    let a = HsRef::new("p.a");
    let b = HsRef::new("p.b");
    let owner_a: NodePath = Arc::from("/srv/a");
    let owner_b: NodePath = Arc::from("/srv/b");

    mux.subscribe(a.clone(), owner_a.clone()).await;
    wait_until("first flush", || sim.counters().sub_calls == 1).await;

    mux.unsubscribe(a, owner_a).await;
    mux.subscribe(b, owner_b).await;
    wait_until("second flush", || {
        let c = sim.counters();
        c.unsub_calls == 1 && c.sub_calls == 2
    })
    .await;
    let log = sim.op_log();
    assert_eq!(
        &log[log.len() - 2..],
        &["watchUnsub".to_string(), "watchSub".to_string()][..]
    );
}

#[tokio::test]
async fn reconnect_replays_live_interests_only() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let mux = h.instance.subscriptions();
    let a = HsRef::new("p.a");
    let b = HsRef::new("p.b");

    mux.subscribe(a.clone(), Arc::from("/srv/a")).await;
    mux.subscribe(b.clone(), Arc::from("/srv/b")).await;
    wait_until("both live", || sim.subscribed_ids().len() == 2).await;
    mux.unsubscribe(b, Arc::from("/srv/b")).await;
    wait_until("one live", || sim.subscribed_ids().len() == 1).await;

    sim.invalidate_watch();
    wait_until("reconnect", || sim.counters().connects == 2).await;
    wait_until("replay", || {
        sim.subscribed_ids() == HashSet::from([a.clone()])
    })
    .await;
}

#[tokio::test]
async fn poll_fans_changes_to_subscribed_nodes() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let point = format!("{}/site.a/p.temp", h.instance.root());
    wait_until("point synced", || {
        h.tree.child(&point, "curVal").is_some()
    })
    .await;

    let id = HsRef::new("p.temp");
    h.tree.subscribe_value(&format!("{point}/curVal"));
    wait_until("watch registered", || sim.subscribed_ids().contains(&id)).await;

    sim.update_cell(&id, "curVal", HsValue::num(73.5));
    wait_until("change applied", || {
        h.tree.value(&format!("{point}/curVal")) == Some(TreeValue::Number(73.5))
    })
    .await;

    // A poll failure forces a reconnect; polling resumes afterwards.
    sim.inject_fault("watchPoll", SimFault::Network);
    wait_until("reconnect", || sim.counters().connects == 2).await;
    sim.update_cell(&id, "curVal", HsValue::num(74.0));
    wait_until("resumed", || {
        h.tree.value(&format!("{point}/curVal")) == Some(TreeValue::Number(74.0))
    })
    .await;
}

#[tokio::test]
async fn last_viewer_detaches_the_point() {
    let sim = SimServer::new();
    seed_demo_site(&sim);
    let h = start_instance(&sim, test_config());
    wait_connected(&h).await;
    let point = format!("{}/site.a/p.temp", h.instance.root());
    wait_until("point synced", || {
        h.tree.child(&point, "curVal").is_some()
    })
    .await;
    let id = HsRef::new("p.temp");

    // Two fields of the same node share one remote subscription.
    h.tree.subscribe_value(&format!("{point}/curVal"));
    h.tree.subscribe_value(&format!("{point}/kind"));
    wait_until("watch registered", || sim.subscribed_ids().contains(&id)).await;
    assert_eq!(sim.counters().sub_calls, 1);

    h.tree.unsubscribe_value(&format!("{point}/curVal"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sim.subscribed_ids().contains(&id));

    h.tree.unsubscribe_value(&format!("{point}/kind"));
    wait_until("watch dropped", || !sim.subscribed_ids().contains(&id)).await;
}
