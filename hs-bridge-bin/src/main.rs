//! Demo binary: runs the configured server instances against an in-process
//! simulated server, mutating a point so live subscriptions have something
//! to show.

use clap::Parser;
use hs_bridge_core::{EngineOptions, ServerInstance};
use hs_bridge_sdk::{
    BridgeError, BridgeResult, ConnectionConfig, HsRef, HsValue, MemoryTree, NodeTree, Row,
    TreeEvent,
};
use hs_bridge_sim::SimServer;
use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hs-bridge", version, about = "Bridge a local node tree to tag servers")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "HS_BRIDGE_CONFIG", default_value = "hs-bridge.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `hs_bridge_core=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    /// Named server instances, one subtree each.
    servers: BTreeMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEntry {
    /// Transport driver. Only the built-in simulator ships here; real
    /// deployments register their own client factories.
    #[serde(default = "ServerEntry::default_driver")]
    driver: String,
    #[serde(flatten)]
    connection: ConnectionConfig,
}

impl ServerEntry {
    fn default_driver() -> String {
        "sim".into()
    }
}

fn init_tracing(arg: Option<&str>) {
    let filter = match arg {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &PathBuf) -> BridgeResult<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|e| BridgeError::Configuration(format!("invalid {}: {e}", path.display())))
}

/// Seed the simulated server with a small site so the demo has a hierarchy
/// to browse and a point to watch.
fn seed_demo_site(server: &SimServer) {
    server.seed_nav(
        None,
        vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("site.demo")))
            .with("dis", HsValue::str("Demo Site"))
            .with("navId", HsValue::Ref(HsRef::new("site.demo")))],
    );
    let temp = Row::new()
        .with("id", HsValue::Ref(HsRef::new("point.temp")))
        .with("dis", HsValue::str("Zone Temp"))
        .with("kind", HsValue::str("number"))
        .with("writable", HsValue::Marker)
        .with("his", HsValue::Marker)
        .with("tz", HsValue::str("New_York"))
        .with("curVal", HsValue::num_with_unit(72.0, "°F"));
    server.seed_nav(Some("site.demo"), vec![temp.clone()]);
    server.seed_point(temp);
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> BridgeResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let config = load_config(&cli.config)?;
    if config.servers.is_empty() {
        return Err(BridgeError::Configuration(
            "no servers configured".into(),
        ));
    }

    let sim = SimServer::new();
    seed_demo_site(&sim);
    let factory = sim.factory();

    let (tree, mut events) = MemoryTree::new();
    let mut instances: Vec<Arc<ServerInstance>> = Vec::new();
    let mut event_taps: Vec<mpsc::UnboundedSender<TreeEvent>> = Vec::new();
    for (name, entry) in config.servers {
        if entry.driver != "sim" {
            return Err(BridgeError::Configuration(format!(
                "unknown driver for {name}: {}",
                entry.driver
            )));
        }
        info!(instance = %name, url = %entry.connection.url, "starting instance");
        let instance = ServerInstance::new(
            &name,
            entry.connection,
            tree.clone() as Arc<dyn NodeTree>,
            Arc::clone(&factory),
            EngineOptions::default(),
        )?;
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        instance.start(tap_rx);
        instances.push(instance);
        event_taps.push(tap_tx);
    }

    // Fan the tree's single demand stream out to every instance; each one
    // ignores events outside its subtree.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            for tap in &event_taps {
                let _ = tap.send(event.clone());
            }
        }
    });

    // Simulated viewer: list each instance root, then keep the demo point's
    // value subscribed so the watch path stays exercised.
    {
        let tree = Arc::clone(&tree);
        let roots: Vec<_> = instances.iter().map(|i| i.root().clone()).collect();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            for root in &roots {
                tree.list(root);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            for root in &roots {
                let cur_val = format!("{root}/site.demo/point.temp/curVal");
                tree.subscribe_value(&cur_val);
            }
        });
    }

    // Mutate the demo point so polls carry changes.
    {
        let sim = Arc::clone(&sim);
        tokio::spawn(async move {
            let id = HsRef::new("point.temp");
            let mut temp = 72.0;
            loop {
                tokio::time::sleep(Duration::from_secs(3)).await;
                temp += 0.5;
                sim.update_cell(&id, "curVal", HsValue::num_with_unit(temp, "°F"));
            }
        });
    }

    info!("running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed, stopping");
    }
    for instance in &instances {
        instance.stop().await;
    }
    info!("stopped");
    Ok(())
}
