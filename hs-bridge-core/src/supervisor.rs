//! Connection lifecycle: lazy session establishment, a single background
//! retry loop per instance, and error-class-driven call retries.

use arc_swap::{ArcSwap, ArcSwapOption};
use backoff::backoff::Backoff;
use hs_bridge_sdk::{
    build_backoff, BridgeError, BridgeResult, ClientFactory, ConnectionConfig, HaystackClient,
    HaystackWatch, NodePath, NodeTree, TreeValue, OP_WATCH_SUB,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Display name reported to the server when opening a watch.
const WATCH_DIS: &str = "HS Bridge";

/// Connection state published to the rest of the engine. The poller and the
/// subscription multiplexer key off `watch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connected {
        watch: bool,
    },
}

/// An established session: the client plus the watch opened at connect time
/// when the server advertises `watchSub`.
pub(crate) struct Session {
    pub client: Arc<dyn HaystackClient>,
    pub watch: Option<Arc<dyn HaystackWatch>>,
}

/// Writes connection status text to the instance's `Status` child node.
pub struct StatusSink {
    tree: Arc<dyn NodeTree>,
    path: NodePath,
}

impl StatusSink {
    pub fn new(tree: Arc<dyn NodeTree>, instance_root: &str) -> Self {
        let path = tree.ensure_child(instance_root, "Status");
        tree.set_display(&path, "Status");
        tree.set_value(&path, TreeValue::String("Not Connected".into()));
        Self { tree, path }
    }

    pub fn set(&self, text: impl Into<String>) {
        self.tree.set_value(&self.path, TreeValue::String(text.into()));
    }
}

struct RetryTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the session slot for one server instance.
///
/// Sessions are established lazily: the first caller that needs one queues a
/// waiter and spawns the retry loop; everyone arriving while the loop runs
/// queues behind it and is flushed in order once a session lands. At most one
/// retry loop exists per instance.
pub struct ConnectionManager {
    config: ArcSwap<ConnectionConfig>,
    factory: Arc<dyn ClientFactory>,
    session: ArcSwapOption<Session>,
    waiters: Mutex<VecDeque<oneshot::Sender<Arc<Session>>>>,
    retry: Mutex<Option<RetryTask>>,
    state_tx: watch::Sender<ConnState>,
    status: StatusSink,
    last_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn ClientFactory>,
        status: StatusSink,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        if !config.enabled {
            status.set("Disabled");
        }
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            factory,
            session: ArcSwapOption::empty(),
            waiters: Mutex::new(VecDeque::new()),
            retry: Mutex::new(None),
            state_tx,
            status,
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.load().enabled && !self.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> Arc<ConnectionConfig> {
        self.config.load_full()
    }

    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// The current watch without queueing for a reconnect, for background
    /// tasks that must not block on session establishment.
    pub(crate) fn current_watch(&self) -> Option<Arc<dyn HaystackWatch>> {
        self.session.load().as_ref().and_then(|s| s.watch.clone())
    }

    /// The established session, waiting behind the retry loop if one is
    /// running. Callers queue in FIFO order and are flushed on connect.
    pub(crate) async fn get_session(self: &Arc<Self>) -> BridgeResult<Arc<Session>> {
        if !self.is_enabled() {
            return Err(BridgeError::Disabled);
        }
        let rx = {
            let retry = self.retry.lock();
            if retry.is_none() {
                if let Some(session) = self.session.load_full() {
                    return Ok(session);
                }
            }
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().push_back(tx);
            rx
        };
        self.ensure_connecting();
        rx.await
            .map_err(|_| BridgeError::Session("connection attempt abandoned".into()))
    }

    pub async fn get_client(self: &Arc<Self>) -> BridgeResult<Arc<dyn HaystackClient>> {
        Ok(Arc::clone(&self.get_session().await?.client))
    }

    /// Start the retry loop unless one is already running.
    pub fn ensure_connecting(self: &Arc<Self>) {
        if !self.is_enabled() {
            // Waiters queued during a concurrent disable would never resolve.
            self.fail_waiters();
            return;
        }
        let mut retry = self.retry.lock();
        if retry.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move { mgr.connect_loop(token).await });
        *retry = Some(RetryTask { handle, cancel });
    }

    async fn connect_loop(self: Arc<Self>, cancel: CancellationToken) {
        let policy = self.config.load().retry;
        let mut bo = build_backoff(&policy);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() || !self.is_enabled() {
                self.fail_waiters();
                return;
            }
            // A session can land between a waiter queueing and this loop
            // spawning; reuse it instead of opening a second one.
            if let Some(session) = self.session.load_full() {
                *self.retry.lock() = None;
                let waiters: Vec<_> = self.waiters.lock().drain(..).collect();
                for waiter in waiters {
                    let _ = waiter.send(Arc::clone(&session));
                }
                return;
            }
            self.status.set("Connecting");
            let config = self.config.load_full();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.fail_waiters();
                    return;
                }
                outcome = self.connect_once(&config) => outcome,
            };
            match outcome {
                Ok(session) => {
                    let session = Arc::new(session);
                    self.session.store(Some(Arc::clone(&session)));
                    *self.last_error.lock() = None;
                    // Clear the retry slot before flushing so waiters that
                    // immediately re-enter see the established session.
                    *self.retry.lock() = None;
                    self.status.set("Connected");
                    info!(
                        url = %config.url,
                        watch = session.watch.is_some(),
                        "connection established"
                    );
                    let waiters: Vec<_> = self.waiters.lock().drain(..).collect();
                    for waiter in waiters {
                        let _ = waiter.send(Arc::clone(&session));
                    }
                    let _ = self.state_tx.send(ConnState::Connected {
                        watch: session.watch.is_some(),
                    });
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let msg = format!("unable to connect to {}: {e}", config.url);
                    *self.last_error.lock() = Some(msg.clone());
                    if self.is_enabled() {
                        self.status.set(msg);
                    }
                    if policy.max_attempts.map(|m| attempt >= m).unwrap_or(false) {
                        warn!(attempt, url = %config.url, "giving up connection retries");
                        *self.retry.lock() = None;
                        self.fail_waiters();
                        return;
                    }
                    let delay = bo
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(policy.max_interval_ms));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        url = %config.url,
                        "connect failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.fail_waiters();
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connection attempt: open the client, probe advertised ops for
    /// watch support, open the watch when advertised.
    async fn connect_once(&self, config: &ConnectionConfig) -> BridgeResult<Session> {
        let client = self.factory.open(config).await?;
        let ops = match client.ops().await {
            Ok(grid) => grid,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };
        let watch_supported = ops.iter().any(|row| {
            row.get("name")
                .map(|v| v.to_string() == OP_WATCH_SUB)
                .unwrap_or(false)
        });
        let watch = if watch_supported {
            match client.watch_open(WATCH_DIS).await {
                Ok(w) => Some(w),
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            }
        } else {
            warn!(url = %config.url, "server does not advertise watchSub, live subscriptions disabled");
            None
        };
        Ok(Session { client, watch })
    }

    fn fail_waiters(&self) {
        self.waiters.lock().clear();
    }

    /// Tear down the session and stop any running retry loop. Idempotent;
    /// callers that were queued for the session get an error.
    pub async fn close(&self) {
        let task = self.retry.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        self.fail_waiters();
        if let Some(session) = self.session.swap(None) {
            if let Some(watch) = &session.watch {
                watch.close().await;
            }
            session.client.close().await;
            debug!("session closed");
        }
        let _ = self.state_tx.send(ConnState::Disconnected);
    }

    pub async fn force_reconnect(self: &Arc<Self>) {
        self.close().await;
        if self.is_enabled() {
            self.ensure_connecting();
        }
    }

    /// Replace the connection settings, tearing down the current session.
    /// A blank password keeps the stored one. Reconnects when enabled.
    pub async fn edit_connection(self: &Arc<Self>, new_config: ConnectionConfig) -> BridgeResult<()> {
        new_config.validate()?;
        info!(
            url = %new_config.url,
            user = %new_config.username,
            enabled = new_config.enabled,
            "editing server connection"
        );
        self.close().await;
        let mut config = new_config;
        if config.password.is_empty() {
            config.password = self.config.load().password.clone();
        }
        let enabled = config.enabled;
        self.config.store(Arc::new(config));
        if enabled {
            self.status.set("Not Connected");
            self.ensure_connecting();
        } else {
            self.status.set("Disabled");
        }
        Ok(())
    }

    /// Final stop: disables the instance permanently and tears down.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.close().await;
    }

    /// Run a foreground call with error-class handling: HTTP redirects force
    /// a reconnect and retry until one resolves, permission failures force a
    /// reconnect and retry exactly once, transport failures tear the session
    /// down and surface immediately.
    pub async fn run_call<T, F, Fut>(self: &Arc<Self>, f: F) -> BridgeResult<T>
    where
        F: Fn(Arc<dyn HaystackClient>) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let mut permission_retried = false;
        loop {
            let session = self.get_session().await?;
            match f(Arc::clone(&session.client)).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_redirect() => {
                    debug!(error = %e, "redirected, reconnecting and retrying");
                    self.force_reconnect().await;
                }
                Err(e) if e.is_permission() && !permission_retried => {
                    permission_retried = true;
                    debug!(error = %e, "permission denied, reconnecting and retrying once");
                    self.force_reconnect().await;
                }
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "transport failure, reconnecting");
                    self.force_reconnect().await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
