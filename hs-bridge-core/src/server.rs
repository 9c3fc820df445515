//! Per-server instance façade: wires the connection manager, subscription
//! multiplexer, poller and nav synchronizer to one subtree of the local node
//! tree, and exposes the foreground operations.

use crate::{
    actions::{self, ActionArgs, ActionRegistry},
    nav::{NavSynchronizer, DEFAULT_MIN_REFRESH},
    poller::ChangePoller,
    subscribe::{SubscriptionMultiplexer, DEFAULT_DEBOUNCE},
    supervisor::{ConnState, ConnectionManager, StatusSink},
};
use hs_bridge_sdk::{
    encode_name, BridgeError, BridgeResult, ClientFactory, ConnectionConfig, Grid, HsRef,
    HsValue, NodePath, NodeTree, TreeEvent, ROOT_PATH,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine timing knobs. Defaults match production behavior; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Debounce window for watch sub/unsub batches.
    pub debounce: Duration,
    /// Minimum age before a node's nav expansion is refreshed.
    pub min_nav_refresh: Duration,
    /// Poll cadence override; None uses the connection config.
    pub poll_interval: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            min_nav_refresh: DEFAULT_MIN_REFRESH,
            poll_interval: None,
        }
    }
}

struct PollerTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One configured server connection rooted at a child of the tree root.
pub struct ServerInstance {
    name: String,
    tree: Arc<dyn NodeTree>,
    root: NodePath,
    manager: Arc<ConnectionManager>,
    mux: SubscriptionMultiplexer,
    nav: Arc<NavSynchronizer>,
    actions: Arc<ActionRegistry>,
    options: EngineOptions,
    cancel: CancellationToken,
    poller: Mutex<Option<PollerTask>>,
}

impl ServerInstance {
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        tree: Arc<dyn NodeTree>,
        factory: Arc<dyn ClientFactory>,
        options: EngineOptions,
    ) -> BridgeResult<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let root = tree.ensure_child(ROOT_PATH, &encode_name(&name));
        tree.set_display(&root, &name);
        let status = StatusSink::new(Arc::clone(&tree), &root);
        let manager = ConnectionManager::new(config, factory, status);
        let cancel = CancellationToken::new();
        let mux =
            SubscriptionMultiplexer::spawn(Arc::clone(&manager), options.debounce, cancel.child_token());
        let actions = Arc::new(ActionRegistry::default());
        let nav = Arc::new(NavSynchronizer::new(
            Arc::clone(&manager),
            Arc::clone(&tree),
            mux.clone(),
            Arc::clone(&actions),
            root.clone(),
            options.min_nav_refresh,
        ));
        Ok(Arc::new(Self {
            name,
            tree,
            root,
            manager,
            mux,
            nav,
            actions,
            options,
            cancel,
            poller: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &NodePath {
        &self.root
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn subscriptions(&self) -> &SubscriptionMultiplexer {
        &self.mux
    }

    /// Start the background listeners and, when enabled, the first
    /// connection attempt. `events` is the tree's demand stream; events for
    /// nodes outside this instance's subtree are ignored.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TreeEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = this.manager.state();
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnState::Connected { watch } => {
                        debug!(instance = %this.name, watch, "connected");
                        let nav = Arc::clone(&this.nav);
                        let root = this.root.clone();
                        tokio::spawn(async move {
                            if let Err(e) = nav.expand(&root).await {
                                warn!(error = %e, "root expansion after connect failed");
                            }
                        });
                        if watch {
                            this.mux.watch_opened().await;
                            this.start_poller();
                        } else {
                            this.stop_poller();
                        }
                    }
                    ConnState::Disconnected => {
                        this.mux.watch_lost().await;
                        this.stop_poller();
                    }
                }
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        event
                    }
                };
                match event {
                    TreeEvent::ListRequested(path) if this.owns(&path) => {
                        let nav = Arc::clone(&this.nav);
                        tokio::spawn(async move {
                            if let Err(e) = nav.expand(&path).await {
                                debug!(node = %path, error = %e, "list-triggered expansion failed");
                            }
                        });
                    }
                    TreeEvent::Subscribed(path) if this.owns(&path) => {
                        this.nav.child_subscribed(&path).await;
                    }
                    TreeEvent::Unsubscribed(path) if this.owns(&path) => {
                        this.nav.child_unsubscribed(&path).await;
                    }
                    _ => {}
                }
            }
        });

        if self.manager.is_enabled() {
            self.manager.ensure_connecting();
        }
    }

    fn owns(&self, path: &str) -> bool {
        path == self.root.as_ref()
            || (path.starts_with(self.root.as_ref())
                && path.as_bytes().get(self.root.len()) == Some(&b'/'))
    }

    fn start_poller(&self) {
        let mut slot = self.poller.lock();
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
        }
        let cancel = self.cancel.child_token();
        let interval = self
            .options
            .poll_interval
            .unwrap_or_else(|| self.manager.config().poll_interval());
        let handle = ChangePoller::spawn(
            Arc::clone(&self.manager),
            self.mux.index(),
            Arc::clone(&self.tree),
            interval,
            cancel.clone(),
        );
        *slot = Some(PollerTask { handle, cancel });
    }

    fn stop_poller(&self) {
        if let Some(task) = self.poller.lock().take() {
            task.cancel.cancel();
        }
    }

    fn ensure_enabled(&self) -> BridgeResult<()> {
        if self.manager.is_enabled() {
            Ok(())
        } else {
            Err(BridgeError::Disabled)
        }
    }

    /// Filter read against the remote.
    pub async fn read(&self, filter: &str, limit: Option<usize>) -> BridgeResult<Grid> {
        self.ensure_enabled()?;
        let filter = filter.to_string();
        self.manager
            .run_call(move |client| {
                let filter = filter.clone();
                async move { client.read_all(&filter, limit).await }
            })
            .await
    }

    /// Axon expression evaluation.
    pub async fn eval(&self, expr: &str) -> BridgeResult<Grid> {
        self.ensure_enabled()?;
        let expr = expr.to_string();
        self.manager
            .run_call(move |client| {
                let expr = expr.clone();
                async move { client.eval(&expr).await }
            })
            .await
    }

    /// Raw op call.
    pub async fn call(&self, op: &str, req: Grid) -> BridgeResult<Grid> {
        self.ensure_enabled()?;
        let op = op.to_string();
        self.manager
            .run_call(move |client| {
                let op = op.clone();
                let req = req.clone();
                async move { client.call(&op, req).await }
            })
            .await
    }

    /// Raw prioritized write, for callers addressing ids directly.
    pub async fn point_write(
        &self,
        id: &HsRef,
        level: u8,
        who: Option<&str>,
        val: Option<HsValue>,
        duration: Option<HsValue>,
    ) -> BridgeResult<Grid> {
        self.ensure_enabled()?;
        if !(1..=17).contains(&level) {
            return Err(BridgeError::Configuration(format!(
                "write level must be 1-17: {level}"
            )));
        }
        let id = id.clone();
        let who = who.map(str::to_string);
        self.manager
            .run_call(move |client| {
                let id = id.clone();
                let who = who.clone();
                let val = val.clone();
                let duration = duration.clone();
                async move {
                    client
                        .point_write(&id, level, who.as_deref(), val, duration)
                        .await
                }
            })
            .await
    }

    /// Invoke the capability bound at an action node's path.
    pub async fn invoke(&self, action_path: &str, args: &ActionArgs) -> BridgeResult<Grid> {
        self.ensure_enabled()?;
        let binding = self.actions.get(action_path).ok_or_else(|| {
            BridgeError::Configuration(format!("no action bound at {action_path}"))
        })?;
        actions::execute(&self.manager, &binding, args).await
    }

    /// History read through the capability bound at an action node's path.
    pub async fn history_read(&self, action_path: &str, range: &str) -> BridgeResult<Grid> {
        self.invoke(action_path, &ActionArgs::with_range(range)).await
    }

    /// Force an expansion of a node in this instance's subtree.
    pub async fn expand(&self, path: &NodePath) -> BridgeResult<()> {
        self.nav.expand(path).await
    }

    /// Replace the connection settings: tears down the session, removes the
    /// navigated subtree, and reconnects when the new config is enabled.
    pub async fn edit_connection(&self, config: ConnectionConfig) -> BridgeResult<()> {
        info!(instance = %self.name, "editing connection");
        self.stop_poller();
        self.nav.clear_navigated(&self.root);
        self.manager.edit_connection(config).await
    }

    /// Stop the instance permanently.
    pub async fn stop(&self) {
        info!(instance = %self.name, "stopping");
        self.cancel.cancel();
        self.stop_poller();
        self.manager.shutdown().await;
    }
}
