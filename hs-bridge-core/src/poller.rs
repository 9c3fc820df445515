//! Periodic change polling against the open watch.
//!
//! Each tick reads the subscription index snapshot, skips the network when no
//! interest exists, and fans changed rows out to every local node that owns
//! the row's id. Row fields are diffed by key against the node's existing
//! field children so stale fields disappear.

use crate::{subscribe::SubIndex, supervisor::ConnectionManager};
use arc_swap::ArcSwap;
use hs_bridge_sdk::{encode_name, Grid, NodeTree, Row};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attribute marking a child node as a synced row field, eligible for
/// diff-removal when the row stops carrying it.
pub(crate) const FIELD_ATTR: &str = "field";

pub struct ChangePoller;

impl ChangePoller {
    /// Spawn the poll task. It runs until cancelled, the watch disappears, or
    /// a poll fails; failure forces a reconnect, and the connection-state
    /// listener starts a fresh poller once the session is back.
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        index: Arc<ArcSwap<SubIndex>>,
        tree: Arc<dyn NodeTree>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "change poller started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("change poller stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot = index.load_full();
                if snapshot.is_empty() {
                    continue;
                }
                let Some(watch) = manager.current_watch() else {
                    debug!("session gone, stopping poller");
                    return;
                };
                if !watch.is_open() {
                    warn!("watch invalidated, reconnecting");
                    manager.force_reconnect().await;
                    return;
                }
                match watch.poll_changes().await {
                    Ok(changes) => apply_changes(tree.as_ref(), &snapshot, &changes),
                    Err(e) => {
                        warn!(error = %e, "poll failed, reconnecting");
                        manager.force_reconnect().await;
                        return;
                    }
                }
            }
        })
    }
}

/// Fan a poll result out to the owners of each changed id. Rows whose id has
/// no local owner are dropped.
pub fn apply_changes(tree: &dyn NodeTree, index: &SubIndex, changes: &Grid) {
    for row in changes {
        let Some(id) = row.id() else { continue };
        let Some(owners) = index.owners(id) else {
            continue;
        };
        for owner in owners {
            apply_row(tree, owner, row);
        }
    }
}

/// Write a row's fields onto a node's children and remove field children the
/// row no longer carries. Idempotent for identical rows.
pub fn apply_row(tree: &dyn NodeTree, owner: &str, row: &Row) {
    let mut seen = HashSet::with_capacity(row.len());
    for (name, value) in row.iter() {
        let encoded = encode_name(name);
        let child = tree.ensure_child(owner, &encoded);
        tree.set_attr(&child, FIELD_ATTR, "true");
        tree.set_value(&child, value.to_tree_value());
        seen.insert(encoded);
    }
    for child in tree.children(owner) {
        if tree.attr(&child, FIELD_ATTR).as_deref() != Some("true") {
            continue;
        }
        if let Some(name) = tree.name_of(&child) {
            if !seen.contains(&name) {
                tree.remove_child(owner, &name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_bridge_sdk::{
        HsRef, HsValue, MemoryTree, NodePath, TreeValue, ROOT_PATH,
    };
    use std::collections::{HashMap, HashSet};

    fn index_of(id: &str, owner: &NodePath) -> SubIndex {
        let mut entries: HashMap<HsRef, HashSet<NodePath>> = HashMap::new();
        entries
            .entry(HsRef::new(id))
            .or_default()
            .insert(owner.clone());
        SubIndex::from_entries(entries)
    }

    #[test]
    fn apply_row_diffs_by_key() {
        let (tree, _rx) = MemoryTree::new();
        let point = tree.ensure_child(ROOT_PATH, "point");
        let index = index_of("p.1", &point);

        let first = Grid::from_rows(vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("p.1")))
            .with("curVal", HsValue::num(1.0))
            .with("curStatus", HsValue::str("ok"))]);
        apply_changes(tree.as_ref(), &index, &first);
        assert_eq!(
            tree.value(&tree.child(&point, "curVal").expect("curVal")),
            Some(TreeValue::Number(1.0))
        );
        assert!(tree.child(&point, "curStatus").is_some());

        // curStatus dropped from the row disappears from the node.
        let second = Grid::from_rows(vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("p.1")))
            .with("curVal", HsValue::num(2.0))]);
        apply_changes(tree.as_ref(), &index, &second);
        assert_eq!(
            tree.value(&tree.child(&point, "curVal").expect("curVal")),
            Some(TreeValue::Number(2.0))
        );
        assert!(tree.child(&point, "curStatus").is_none());

        // Identical rows are idempotent.
        apply_changes(tree.as_ref(), &index, &second);
        assert_eq!(tree.children(&point).len(), 2);
    }

    #[test]
    fn rows_without_owner_are_dropped() {
        let (tree, _rx) = MemoryTree::new();
        let point = tree.ensure_child(ROOT_PATH, "point");
        let index = index_of("p.1", &point);
        let changes = Grid::from_rows(vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("p.other")))
            .with("curVal", HsValue::num(9.0))]);
        apply_changes(tree.as_ref(), &index, &changes);
        assert!(tree.child(&point, "curVal").is_none());
    }

    #[test]
    fn non_field_children_survive_diff() {
        let (tree, _rx) = MemoryTree::new();
        let point = tree.ensure_child(ROOT_PATH, "point");
        tree.ensure_child(&point, "pointWrite");
        let index = index_of("p.1", &point);
        let changes = Grid::from_rows(vec![Row::new()
            .with("id", HsValue::Ref(HsRef::new("p.1")))
            .with("curVal", HsValue::num(1.0))]);
        apply_changes(tree.as_ref(), &index, &changes);
        assert!(tree.child(&point, "pointWrite").is_some());
    }
}
