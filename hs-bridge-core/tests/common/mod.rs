use hs_bridge_core::{ConnState, EngineOptions, ServerInstance};
use hs_bridge_sdk::{
    ConnectionConfig, HsRef, HsValue, MemoryTree, NodeTree, RetryPolicy, Row,
};
use hs_bridge_sim::SimServer;
use std::{
    sync::{Arc, Once},
    time::Duration,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        retry: RetryPolicy::immediate(),
        ..ConnectionConfig::new("sim://test")
    }
}

pub fn test_options() -> EngineOptions {
    EngineOptions {
        debounce: Duration::from_millis(50),
        min_nav_refresh: Duration::from_secs(60),
        poll_interval: Some(Duration::from_millis(50)),
    }
}

pub struct Harness {
    pub sim: Arc<SimServer>,
    pub tree: Arc<MemoryTree>,
    pub instance: Arc<ServerInstance>,
}

pub fn start_instance(sim: &Arc<SimServer>, config: ConnectionConfig) -> Harness {
    init_tracing();
    let (tree, events) = MemoryTree::new();
    let instance = ServerInstance::new(
        "srv",
        config,
        Arc::clone(&tree) as Arc<dyn NodeTree>,
        sim.factory(),
        test_options(),
    )
    .expect("instance");
    instance.start(events);
    Harness {
        sim: Arc::clone(sim),
        tree,
        instance,
    }
}

pub async fn wait_connected(h: &Harness) {
    let mut rx = h.instance.manager().state();
    tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| matches!(s, ConnState::Connected { .. })),
    )
    .await
    .expect("timeout waiting for connection")
    .expect("state channel closed");
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout waiting for {what}");
}

pub fn demo_point() -> Row {
    Row::new()
        .with("id", HsValue::Ref(HsRef::new("p.temp")))
        .with("dis", HsValue::str("Zone Temp"))
        .with("kind", HsValue::str("number"))
        .with("writable", HsValue::Marker)
        .with("his", HsValue::Marker)
        .with("tz", HsValue::str("New_York"))
        .with("curVal", HsValue::num(72.0))
}

/// One site with a nav handle and one writable, historized point under it.
pub fn seed_demo_site(sim: &SimServer) {
    sim.seed_nav(
        None,
        vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("site.a")))
            .with("dis", HsValue::str("Site A"))
            .with("navId", HsValue::Ref(HsRef::new("site.a")))],
    );
    let point = demo_point();
    sim.seed_nav(Some("site.a"), vec![point.clone()]);
    sim.seed_point(point);
}
