//! Watch-subscription multiplexer.
//!
//! Many local nodes can hang off one remote id; the multiplexer ref-counts
//! interest per id and turns edge transitions (zero to positive, positive to
//! zero) into debounced watch sub/unsub batches. A single actor task owns all
//! state, so flushes never overlap; the data path reads a lock-free snapshot
//! of the id-to-owners index.

use crate::supervisor::ConnectionManager;
use arc_swap::ArcSwap;
use hs_bridge_sdk::{HsRef, NodePath};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Immutable snapshot of which local nodes own an interest in each remote id.
#[derive(Debug, Clone, Default)]
pub struct SubIndex {
    entries: HashMap<HsRef, HashSet<NodePath>>,
}

impl SubIndex {
    pub(crate) fn from_entries(entries: HashMap<HsRef, HashSet<NodePath>>) -> Self {
        Self { entries }
    }

    pub fn owners(&self, id: &HsRef) -> Option<&HashSet<NodePath>> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &HsRef> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum SubCommand {
    Subscribe { id: HsRef, owner: NodePath },
    Unsubscribe { id: HsRef, owner: NodePath },
    /// A session with an open watch was established; replay every id with
    /// positive interest.
    WatchOpened,
    /// The session went away; pending batches are void.
    WatchLost,
}

/// Handle to the multiplexer actor. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    tx: mpsc::Sender<SubCommand>,
    index: Arc<ArcSwap<SubIndex>>,
}

impl SubscriptionMultiplexer {
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let index = Arc::new(ArcSwap::from_pointee(SubIndex::default()));
        let actor = Actor {
            rx,
            cancel,
            manager,
            index: Arc::clone(&index),
            entries: HashMap::new(),
            active: HashSet::new(),
            pending_sub: HashSet::new(),
            pending_unsub: HashSet::new(),
            watch_ready: false,
            debounce,
            deadline: None,
        };
        tokio::spawn(actor.run());
        Self { tx, index }
    }

    /// Register a local node's interest in a remote id.
    pub async fn subscribe(&self, id: HsRef, owner: NodePath) {
        let _ = self.tx.send(SubCommand::Subscribe { id, owner }).await;
    }

    /// Drop a local node's interest in a remote id.
    pub async fn unsubscribe(&self, id: HsRef, owner: NodePath) {
        let _ = self.tx.send(SubCommand::Unsubscribe { id, owner }).await;
    }

    pub async fn watch_opened(&self) {
        let _ = self.tx.send(SubCommand::WatchOpened).await;
    }

    pub async fn watch_lost(&self) {
        let _ = self.tx.send(SubCommand::WatchLost).await;
    }

    /// Shared index handle for the data path (poller).
    pub fn index(&self) -> Arc<ArcSwap<SubIndex>> {
        Arc::clone(&self.index)
    }

    pub fn snapshot(&self) -> Arc<SubIndex> {
        self.index.load_full()
    }
}

struct Actor {
    rx: mpsc::Receiver<SubCommand>,
    cancel: CancellationToken,
    manager: Arc<ConnectionManager>,
    index: Arc<ArcSwap<SubIndex>>,
    entries: HashMap<HsRef, HashSet<NodePath>>,
    /// Ids successfully subscribed on the current watch.
    active: HashSet<HsRef>,
    pending_sub: HashSet<HsRef>,
    pending_unsub: HashSet<HsRef>,
    watch_ready: bool,
    debounce: Duration,
    deadline: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    if self.apply(cmd) {
                        self.flush().await;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
    }

    /// Apply one command to the interest map and pending sets. Returns true
    /// when the pending work must flush immediately instead of debouncing.
    fn apply(&mut self, cmd: SubCommand) -> bool {
        match cmd {
            SubCommand::Subscribe { id, owner } => {
                let set = self.entries.entry(id.clone()).or_default();
                let first = set.is_empty();
                set.insert(owner);
                self.publish();
                if first && self.watch_ready {
                    if self.pending_unsub.remove(&id) {
                        // Still live remotely; the pending removal cancels.
                    } else if !self.active.contains(&id) && self.pending_sub.insert(id) {
                        self.arm();
                    }
                }
                false
            }
            SubCommand::Unsubscribe { id, owner } => {
                let emptied = match self.entries.get_mut(&id) {
                    Some(set) => {
                        set.remove(&owner);
                        set.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.entries.remove(&id);
                }
                self.publish();
                if emptied && self.watch_ready {
                    if self.pending_sub.remove(&id) {
                        // Never sent; the queued subscribe cancels.
                    } else if self.active.contains(&id) && self.pending_unsub.insert(id) {
                        self.arm();
                    }
                }
                false
            }
            SubCommand::WatchOpened => {
                debug!(ids = self.entries.len(), "watch opened, replaying interests");
                self.watch_ready = true;
                self.active.clear();
                self.pending_unsub.clear();
                self.pending_sub = self.entries.keys().cloned().collect();
                self.deadline = None;
                !self.pending_sub.is_empty()
            }
            SubCommand::WatchLost => {
                self.watch_ready = false;
                self.active.clear();
                self.pending_sub.clear();
                self.pending_unsub.clear();
                self.deadline = None;
                false
            }
        }
    }

    fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.debounce);
        }
    }

    fn publish(&self) {
        self.index.store(Arc::new(SubIndex {
            entries: self.entries.clone(),
        }));
    }

    /// Drain the pending sets into watch calls, unsubscribes first. Commands
    /// that arrive during the network calls are absorbed and, when they leave
    /// new pending work, flushed in the same pass instead of waiting for the
    /// next debounce window.
    async fn flush(&mut self) {
        self.deadline = None;
        loop {
            let to_unsub: Vec<HsRef> = std::mem::take(&mut self.pending_unsub)
                .into_iter()
                .collect();
            let to_sub: Vec<HsRef> = std::mem::take(&mut self.pending_sub)
                .into_iter()
                .collect();
            if to_unsub.is_empty() && to_sub.is_empty() {
                return;
            }
            if !to_unsub.is_empty() {
                for id in &to_unsub {
                    self.active.remove(id);
                }
                self.send_batch(&to_unsub, false).await;
            }
            if !to_sub.is_empty() && self.send_batch(&to_sub, true).await {
                self.active.extend(to_sub);
            }
            while let Ok(cmd) = self.rx.try_recv() {
                let _ = self.apply(cmd);
            }
            self.deadline = None;
        }
    }

    async fn send_batch(&self, ids: &[HsRef], subscribe: bool) -> bool {
        // A lost watch voids the batch; the reconnect replays interests.
        let Some(watch) = self.manager.current_watch().filter(|w| w.is_open()) else {
            warn!(count = ids.len(), subscribe, "watch unavailable, dropping batch");
            return false;
        };
        let result = if subscribe {
            watch.sub(ids).await
        } else {
            watch.unsub(ids).await
        };
        match result {
            Ok(()) => {
                debug!(count = ids.len(), subscribe, "watch batch sent");
                true
            }
            Err(e) => {
                warn!(count = ids.len(), subscribe, error = %e, "watch batch failed");
                false
            }
        }
    }
}
