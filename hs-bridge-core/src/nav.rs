//! Lazy nav-tree synchronization.
//!
//! Remote nav rows are mirrored as local nodes on demand: expanding a node
//! issues a `nav` call keyed by the node's stored nav handle, builds or
//! updates a child per row, attaches write/invoke/history capabilities, and
//! eagerly expands one further level so freshly revealed children are never
//! blank. Expansion results are cached per node and refreshed at most once
//! per minute by default.

use crate::{
    actions::{ActionBinding, ActionRegistry},
    poller::FIELD_ATTR,
    subscribe::SubscriptionMultiplexer,
    supervisor::ConnectionManager,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use hs_bridge_sdk::{
    encode_name, BridgeError, BridgeResult, Grid, HsRef, HsValue, NodePath, NodeTree,
    Row, ValueKind,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

pub const DEFAULT_MIN_REFRESH: Duration = Duration::from_secs(60);

/// Opaque nav handle for re-listing a node, as the remote issued it.
const ATTR_NAV_ID: &str = "navId";
/// Whether the stored handle was a ref or plain text.
const ATTR_NAV_ID_KIND: &str = "navIdKind";
/// Unix-millisecond timestamp of the node's last successful expansion.
const ATTR_LAST_NAV: &str = "lastNav";
/// Marks a node as an invokable capability rather than synced data.
pub(crate) const ATTR_ACTION: &str = "action";

/// Declared remote action, embedded as a JSON array in a row's `actions`
/// cell: `[{"name": ..., "dis": ..., "args": {param: kind}}]`.
#[derive(Debug, Deserialize)]
struct ActionDocEntry {
    name: String,
    #[serde(default)]
    dis: Option<String>,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

/// Tracks value-subscription interest per synced node so the multiplexer
/// sees one subscribe on the first interested child and one unsubscribe when
/// the last goes away.
#[derive(Default)]
struct NodeSubState {
    id: Option<HsRef>,
    subscribed: HashSet<NodePath>,
}

pub struct NavSynchronizer {
    manager: Arc<ConnectionManager>,
    tree: Arc<dyn NodeTree>,
    mux: SubscriptionMultiplexer,
    actions: Arc<ActionRegistry>,
    root: NodePath,
    min_refresh: Duration,
    /// Nodes currently expanding; re-entrant expand requests are dropped.
    expanding: Mutex<HashSet<NodePath>>,
    node_subs: Mutex<HashMap<NodePath, NodeSubState>>,
    /// Field child path to the synced node that owns it.
    field_owner: Mutex<HashMap<NodePath, NodePath>>,
}

impl NavSynchronizer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        tree: Arc<dyn NodeTree>,
        mux: SubscriptionMultiplexer,
        actions: Arc<ActionRegistry>,
        root: NodePath,
        min_refresh: Duration,
    ) -> Self {
        Self {
            manager,
            tree,
            mux,
            actions,
            root,
            min_refresh,
            expanding: Mutex::new(HashSet::new()),
            node_subs: Mutex::new(HashMap::new()),
            field_owner: Mutex::new(HashMap::new()),
        }
    }

    /// Expand a node: nav-call its handle and sync the result. Fresh enough
    /// nodes and nodes already mid-expansion are skipped.
    pub async fn expand(&self, path: &NodePath) -> BridgeResult<()> {
        if !self.manager.is_enabled() {
            return Err(BridgeError::Disabled);
        }
        let nav_id = self.nav_handle(path);
        if nav_id.is_none() && *path != self.root {
            return Ok(());
        }
        if let Some(last) = self
            .tree
            .attr(path, ATTR_LAST_NAV)
            .and_then(|s| s.parse::<i64>().ok())
        {
            if now_ms().saturating_sub(last) < self.min_refresh.as_millis() as i64 {
                return Ok(());
            }
        }
        if !self.expanding.lock().insert(path.clone()) {
            return Ok(());
        }
        let result = async {
            let grid = self.nav_call(nav_id).await?;
            self.apply_nav(path, &grid, true).await
        }
        .await;
        self.expanding.lock().remove(path);
        match &result {
            Ok(()) => self
                .tree
                .set_attr(path, ATTR_LAST_NAV, &now_ms().to_string()),
            Err(e) => debug!(node = %path, error = %e, "expansion failed"),
        }
        result
    }

    async fn nav_call(&self, nav_id: Option<HsValue>) -> BridgeResult<Grid> {
        let req = match nav_id {
            Some(v) => Grid::single("navId", v),
            None => Grid::empty(),
        };
        self.manager
            .run_call(move |client| {
                let req = req.clone();
                async move { client.call("nav", req).await }
            })
            .await
    }

    /// Sync one nav result under a parent. Rows carrying `equipRef` are
    /// deferred and nested one level under a child keyed by the group ref.
    fn apply_nav<'a>(
        &'a self,
        parent: &'a NodePath,
        grid: &'a Grid,
        recurse: bool,
    ) -> BoxFuture<'a, BridgeResult<()>> {
        async move {
            let mut grouped: Vec<&Row> = Vec::new();
            for row in grid {
                if row.has("equipRef") {
                    grouped.push(row);
                    continue;
                }
                self.build_child(parent, row, recurse).await?;
            }
            for row in grouped {
                let Some(group) = row.get("equipRef").and_then(HsValue::as_ref_id) else {
                    continue;
                };
                let group_name = encode_name(group.as_str());
                let group_path = self.tree.ensure_child(parent, &group_name);
                self.tree.set_display(&group_path, group.as_str());
                self.build_child(&group_path, row, recurse).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Build or update one child from a nav row. Rows with no usable name
    /// are dropped.
    async fn build_child(
        &self,
        parent: &NodePath,
        row: &Row,
        recurse: bool,
    ) -> BridgeResult<()> {
        let Some(name) = derive_name(row) else {
            debug!(parent = %parent, "dropping nav row without id or dis");
            return Ok(());
        };
        let encoded = encode_name(&name);
        if encoded.is_empty() {
            return Ok(());
        }
        let child = self.tree.ensure_child(parent, &encoded);
        match row
            .get("navName")
            .and_then(HsValue::as_str)
            .or_else(|| row.dis())
        {
            Some(dis) => self.tree.set_display(&child, dis),
            None if encoded != name => self.tree.set_display(&child, &name),
            None => {}
        }

        if row.has_marker("writable") {
            if let (Some(id), Some(kind)) = (row.id(), row.get("kind")) {
                match kind.to_string().parse::<ValueKind>() {
                    Ok(kind) => self.attach_point_write(&child, id.clone(), kind),
                    Err(e) => warn!(node = %child, error = %e, "skipping writable point"),
                }
            }
        }
        if let (Some(id), Some(doc)) = (row.id(), row.get("actions").and_then(HsValue::as_str)) {
            self.attach_invoke_actions(&child, id.clone(), doc);
        }

        if let Some(handle) = row.get("navId") {
            self.store_nav_handle(&child, handle);
            if recurse {
                // One eager level so the child is populated before it is
                // ever listed; deeper levels stay lazy.
                match self.nav_call(Some(handle.clone())).await {
                    Ok(grid) => match self.apply_nav(&child, &grid, false).await {
                        Ok(()) => self
                            .tree
                            .set_attr(&child, ATTR_LAST_NAV, &now_ms().to_string()),
                        Err(e) => warn!(node = %child, error = %e, "eager expansion failed"),
                    },
                    Err(e) => warn!(node = %child, error = %e, "eager expansion failed"),
                }
            }
        }

        self.sync_row_fields(&child, row);
        Ok(())
    }

    /// Write the row's cells as field children and attach the point-level
    /// capabilities (`set` on writable points, `getHistory` on historized
    /// ones) to the `curVal` child.
    fn sync_row_fields(&self, node: &NodePath, row: &Row) {
        if let Some(id) = row.id() {
            self.node_subs
                .lock()
                .entry(node.clone())
                .or_default()
                .id = Some(id.clone());
        }
        let mut cur_val: Option<NodePath> = None;
        let mut kind: Option<ValueKind> = None;
        let mut tz: Option<Arc<str>> = None;
        let mut writable = false;
        let mut historized = false;
        for (name, value) in row.iter() {
            match name {
                "writable" => writable = value.is_marker(),
                "his" => historized = value.is_marker(),
                "kind" => kind = value.to_string().parse().ok(),
                "tz" => tz = Some(Arc::from(value.to_string())),
                _ => {}
            }
            let encoded = encode_name(name);
            let child = self.tree.ensure_child(node, &encoded);
            self.tree.set_attr(&child, FIELD_ATTR, "true");
            self.tree.set_value(&child, value.to_tree_value());
            self.field_owner.lock().insert(child.clone(), node.clone());
            if name == "curVal" {
                cur_val = Some(child);
            }
        }
        if let (Some(cur_val), Some(id)) = (cur_val, row.id()) {
            if writable {
                if let Some(kind) = kind {
                    self.attach_set(&cur_val, id.clone(), kind);
                }
            }
            if historized && tz.is_some() {
                self.attach_history(&cur_val, id.clone(), tz);
            }
        }
    }

    fn attach_point_write(&self, node: &NodePath, id: HsRef, kind: ValueKind) {
        let path = self.tree.ensure_child(node, "pointWrite");
        self.tree.set_display(&path, "Point Write");
        self.tree.set_attr(&path, ATTR_ACTION, "pointWrite");
        self.actions
            .register(path, ActionBinding::PointWrite { id, kind });
    }

    fn attach_set(&self, node: &NodePath, id: HsRef, kind: ValueKind) {
        let path = self.tree.ensure_child(node, "set");
        self.tree.set_display(&path, "Set");
        self.tree.set_attr(&path, ATTR_ACTION, "set");
        self.actions.register(path, ActionBinding::Set { id, kind });
    }

    fn attach_history(&self, node: &NodePath, id: HsRef, tz: Option<Arc<str>>) {
        let path = self.tree.ensure_child(node, "getHistory");
        self.tree.set_display(&path, "Get History");
        self.tree.set_attr(&path, ATTR_ACTION, "getHistory");
        self.actions
            .register(path, ActionBinding::History { id, tz });
    }

    /// Parse a row's embedded action doc and bind one invokable child per
    /// declared action. A malformed doc is logged and skipped.
    fn attach_invoke_actions(&self, node: &NodePath, id: HsRef, doc: &str) {
        let entries: Vec<ActionDocEntry> = match serde_json::from_str(doc) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(node = %node, error = %e, "malformed action doc");
                return;
            }
        };
        for entry in entries {
            let encoded = encode_name(&entry.name);
            if encoded.is_empty() {
                continue;
            }
            let mut params: Vec<(Arc<str>, ValueKind)> = Vec::with_capacity(entry.args.len());
            for (param, kind) in &entry.args {
                match kind.parse::<ValueKind>() {
                    Ok(kind) => params.push((Arc::from(param.as_str()), kind)),
                    Err(e) => {
                        warn!(node = %node, action = %entry.name, error = %e, "skipping parameter")
                    }
                }
            }
            let path = self.tree.ensure_child(node, &encoded);
            self.tree
                .set_display(&path, entry.dis.as_deref().unwrap_or(&entry.name));
            self.tree.set_attr(&path, ATTR_ACTION, "invoke");
            self.actions.register(
                path,
                ActionBinding::Invoke {
                    id: id.clone(),
                    action: Arc::from(entry.name),
                    params,
                },
            );
        }
    }

    fn store_nav_handle(&self, node: &NodePath, handle: &HsValue) {
        match handle {
            HsValue::Ref(r) => {
                self.tree.set_attr(node, ATTR_NAV_ID, r.as_str());
                self.tree.set_attr(node, ATTR_NAV_ID_KIND, "ref");
            }
            other => {
                self.tree.set_attr(node, ATTR_NAV_ID, &other.to_string());
                self.tree.set_attr(node, ATTR_NAV_ID_KIND, "str");
            }
        }
    }

    fn nav_handle(&self, node: &str) -> Option<HsValue> {
        let raw = self.tree.attr(node, ATTR_NAV_ID)?;
        Some(
            match self.tree.attr(node, ATTR_NAV_ID_KIND).as_deref() {
                Some("ref") => HsValue::Ref(HsRef::new(raw)),
                _ => HsValue::str(raw),
            },
        )
    }

    /// A downstream viewer subscribed to a field child. The first interested
    /// child of a node registers the node's id with the multiplexer.
    pub async fn child_subscribed(&self, path: &NodePath) {
        let Some(owner) = self.field_owner.lock().get(path).cloned() else {
            return;
        };
        let register = {
            let mut subs = self.node_subs.lock();
            let state = subs.entry(owner.clone()).or_default();
            let first = state.subscribed.is_empty();
            state.subscribed.insert(path.clone());
            if first {
                state.id.clone()
            } else {
                None
            }
        };
        if let Some(id) = register {
            debug!(node = %owner, id = %id, "first field subscribed");
            self.mux.subscribe(id, owner).await;
        }
    }

    /// A downstream viewer dropped a field subscription. The last one of a
    /// node deregisters the node's id.
    pub async fn child_unsubscribed(&self, path: &NodePath) {
        let Some(owner) = self.field_owner.lock().get(path).cloned() else {
            return;
        };
        let deregister = {
            let mut subs = self.node_subs.lock();
            let Some(state) = subs.get_mut(&owner) else {
                return;
            };
            if state.subscribed.remove(path) && state.subscribed.is_empty() {
                state.id.clone()
            } else {
                None
            }
        };
        if let Some(id) = deregister {
            debug!(node = %owner, id = %id, "last field unsubscribed");
            self.mux.unsubscribe(id, owner).await;
        }
    }

    /// Remove every navigated child under a root and forget its bindings and
    /// subscription state. Children without a nav handle (Status, action
    /// nodes) survive.
    pub fn clear_navigated(&self, root: &NodePath) {
        for child in self.tree.children(root) {
            if self.tree.attr(&child, ATTR_NAV_ID).is_none() {
                continue;
            }
            let Some(name) = self.tree.name_of(&child) else {
                continue;
            };
            self.actions.prune_prefix(&child);
            self.prune_tracking(&child);
            self.tree.remove_child(root, &name);
        }
        self.tree.remove_attr(root, ATTR_LAST_NAV);
    }

    fn prune_tracking(&self, prefix: &NodePath) {
        let nested = format!("{prefix}/");
        self.node_subs
            .lock()
            .retain(|path, _| path != prefix && !path.starts_with(&nested));
        self.field_owner
            .lock()
            .retain(|path, owner| {
                path != prefix
                    && !path.starts_with(&nested)
                    && owner != prefix
                    && !owner.starts_with(&nested)
            });
    }
}

/// Local name for a nav row: the id's text when present, else display text.
fn derive_name(row: &Row) -> Option<String> {
    if let Some(id) = row.id() {
        return Some(id.as_str().to_string());
    }
    row.dis().map(str::to_string)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
