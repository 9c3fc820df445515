use crate::value::TreeValue;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::mpsc;

/// Absolute, `/`-separated path of a node in the local tree.
pub type NodePath = Arc<str>;

pub const ROOT_PATH: &str = "/";

/// Join a child name onto a parent path.
pub fn join(parent: &str, name: &str) -> NodePath {
    if parent == ROOT_PATH {
        Arc::from(format!("/{name}"))
    } else {
        Arc::from(format!("{parent}/{name}"))
    }
}

/// Percent-encode the characters a node name may not contain.
///
/// Escapes the path separator and shell-hostile characters anywhere, and the
/// reserved leading characters `.`/`$`/`@` only at position zero, so encoded
/// names stay readable.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        let banned = matches!(
            c,
            '/' | '\\' | '?' | '*' | ':' | '|' | '"' | '<' | '>' | '%'
        ) || (i == 0 && matches!(c, '.' | '$' | '@'));
        if banned {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Demand signals emitted by the tree's consumer side: a downstream viewer
/// listed a node or opened/closed a value subscription on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    ListRequested(NodePath),
    Subscribed(NodePath),
    Unsubscribed(NodePath),
}

/// Repository interface over the local node tree.
///
/// The tree library owns node identity and storage; the engine only reads and
/// writes values, attributes and children through this trait, which keeps a
/// fake implementation trivial for tests.
pub trait NodeTree: Send + Sync {
    /// Create the child if missing, reuse it otherwise.
    fn ensure_child(&self, parent: &str, name: &str) -> NodePath;

    fn child(&self, parent: &str, name: &str) -> Option<NodePath>;

    fn children(&self, path: &str) -> Vec<NodePath>;

    fn name_of(&self, path: &str) -> Option<String>;

    /// Remove a child and its subtree. Returns false when absent.
    fn remove_child(&self, parent: &str, name: &str) -> bool;

    fn set_value(&self, path: &str, value: TreeValue);

    fn value(&self, path: &str) -> Option<TreeValue>;

    fn set_display(&self, path: &str, display: &str);

    fn display(&self, path: &str) -> Option<String>;

    /// Node attributes: small string-keyed metadata (nav handles, cache
    /// timestamps, capability markers).
    fn set_attr(&self, path: &str, key: &str, value: &str);

    fn attr(&self, path: &str, key: &str) -> Option<String>;

    fn remove_attr(&self, path: &str, key: &str);
}

#[derive(Debug, Default)]
struct NodeRecord {
    name: String,
    display: Option<String>,
    value: Option<TreeValue>,
    attrs: HashMap<String, String>,
    children: BTreeMap<String, NodePath>,
}

/// In-memory `NodeTree` with a demand-event stream.
///
/// Serves as the reference implementation for the binary and the fake for
/// integration tests; the consumer-side methods (`list`, `subscribe_value`,
/// `unsubscribe_value`) simulate downstream viewer activity.
pub struct MemoryTree {
    nodes: RwLock<HashMap<NodePath, NodeRecord>>,
    events: mpsc::UnboundedSender<TreeEvent>,
}

impl MemoryTree {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TreeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = HashMap::new();
        nodes.insert(
            NodePath::from(ROOT_PATH),
            NodeRecord {
                name: String::new(),
                ..NodeRecord::default()
            },
        );
        (
            Arc::new(Self {
                nodes: RwLock::new(nodes),
                events: tx,
            }),
            rx,
        )
    }

    /// A downstream viewer listed this node.
    pub fn list(&self, path: &str) {
        let _ = self.events.send(TreeEvent::ListRequested(Arc::from(path)));
    }

    /// A downstream viewer opened a value subscription on this node.
    pub fn subscribe_value(&self, path: &str) {
        let _ = self.events.send(TreeEvent::Subscribed(Arc::from(path)));
    }

    /// A downstream viewer closed its value subscription on this node.
    pub fn unsubscribe_value(&self, path: &str) {
        let _ = self.events.send(TreeEvent::Unsubscribed(Arc::from(path)));
    }

    fn collect_subtree(
        nodes: &HashMap<NodePath, NodeRecord>,
        path: &str,
        out: &mut Vec<NodePath>,
    ) {
        if let Some(record) = nodes.get(path) {
            for child in record.children.values() {
                Self::collect_subtree(nodes, child, out);
            }
        }
        out.push(Arc::from(path));
    }
}

impl NodeTree for MemoryTree {
    fn ensure_child(&self, parent: &str, name: &str) -> NodePath {
        let path = join(parent, name);
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&path) {
            nodes.insert(
                path.clone(),
                NodeRecord {
                    name: name.to_string(),
                    ..NodeRecord::default()
                },
            );
        }
        if let Some(record) = nodes.get_mut(parent) {
            record.children.insert(name.to_string(), path.clone());
        }
        path
    }

    fn child(&self, parent: &str, name: &str) -> Option<NodePath> {
        self.nodes
            .read()
            .get(parent)
            .and_then(|r| r.children.get(name).cloned())
    }

    fn children(&self, path: &str) -> Vec<NodePath> {
        self.nodes
            .read()
            .get(path)
            .map(|r| r.children.values().cloned().collect())
            .unwrap_or_default()
    }

    fn name_of(&self, path: &str) -> Option<String> {
        self.nodes.read().get(path).map(|r| r.name.clone())
    }

    fn remove_child(&self, parent: &str, name: &str) -> bool {
        let mut nodes = self.nodes.write();
        let Some(child_path) = nodes
            .get_mut(parent)
            .and_then(|r| r.children.remove(name))
        else {
            return false;
        };
        let mut doomed = Vec::new();
        Self::collect_subtree(&nodes, &child_path, &mut doomed);
        for path in doomed {
            nodes.remove(&path);
        }
        true
    }

    fn set_value(&self, path: &str, value: TreeValue) {
        if let Some(record) = self.nodes.write().get_mut(path) {
            record.value = Some(value);
        }
    }

    fn value(&self, path: &str) -> Option<TreeValue> {
        self.nodes.read().get(path).and_then(|r| r.value.clone())
    }

    fn set_display(&self, path: &str, display: &str) {
        if let Some(record) = self.nodes.write().get_mut(path) {
            record.display = Some(display.to_string());
        }
    }

    fn display(&self, path: &str) -> Option<String> {
        self.nodes.read().get(path).and_then(|r| r.display.clone())
    }

    fn set_attr(&self, path: &str, key: &str, value: &str) {
        if let Some(record) = self.nodes.write().get_mut(path) {
            record.attrs.insert(key.to_string(), value.to_string());
        }
    }

    fn attr(&self, path: &str, key: &str) -> Option<String> {
        self.nodes
            .read()
            .get(path)
            .and_then(|r| r.attrs.get(key).cloned())
    }

    fn remove_attr(&self, path: &str, key: &str) {
        if let Some(record) = self.nodes.write().get_mut(path) {
            record.attrs.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_reuses_existing_child() {
        let (tree, _rx) = MemoryTree::new();
        let a = tree.ensure_child(ROOT_PATH, "site");
        tree.set_value(&a, TreeValue::Number(1.0));
        let b = tree.ensure_child(ROOT_PATH, "site");
        assert_eq!(a, b);
        assert_eq!(tree.value(&b), Some(TreeValue::Number(1.0)));
        assert_eq!(tree.children(ROOT_PATH).len(), 1);
    }

    #[test]
    fn remove_child_drops_subtree() {
        let (tree, _rx) = MemoryTree::new();
        let site = tree.ensure_child(ROOT_PATH, "site");
        let point = tree.ensure_child(&site, "point");
        tree.ensure_child(&point, "curVal");
        assert!(tree.remove_child(ROOT_PATH, "site"));
        assert!(tree.child(ROOT_PATH, "site").is_none());
        assert!(tree.value(&point).is_none());
        assert!(!tree.remove_child(ROOT_PATH, "site"));
    }

    #[test]
    fn encode_name_escapes_reserved_characters() {
        assert_eq!(encode_name("a/b"), "a%2Fb");
        assert_eq!(encode_name(".hidden"), "%2Ehidden");
        assert_eq!(encode_name("plain"), "plain");
        assert_eq!(encode_name("a.b"), "a.b");
    }

    #[test]
    fn consumer_events_flow() {
        let (tree, mut rx) = MemoryTree::new();
        tree.list(ROOT_PATH);
        tree.subscribe_value("/a");
        tree.unsubscribe_value("/a");
        assert_eq!(
            rx.try_recv().expect("event"),
            TreeEvent::ListRequested(Arc::from(ROOT_PATH))
        );
        assert_eq!(
            rx.try_recv().expect("event"),
            TreeEvent::Subscribed(Arc::from("/a"))
        );
        assert_eq!(
            rx.try_recv().expect("event"),
            TreeEvent::Unsubscribed(Arc::from("/a"))
        );
    }
}
