//! Capability bindings attached to synced nodes and their execution against
//! the remote server.

use crate::supervisor::ConnectionManager;
use hs_bridge_sdk::{
    BridgeError, BridgeResult, Grid, HsRef, HsValue, TreeValue, ValueKind,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Default priority-array level for point writes.
pub const DEFAULT_WRITE_LEVEL: u8 = 17;

/// Default history range when the caller gives none.
pub const DEFAULT_HIS_RANGE: &str = "today";

/// A remote capability bound to a local action node.
#[derive(Debug, Clone)]
pub enum ActionBinding {
    /// Full prioritized write: level, actor, value, expiry duration.
    PointWrite { id: HsRef, kind: ValueKind },
    /// Value-only convenience write at the default level.
    Set { id: HsRef, kind: ValueKind },
    /// Named remote action with a declared parameter list.
    Invoke {
        id: HsRef,
        action: Arc<str>,
        params: Vec<(Arc<str>, ValueKind)>,
    },
    /// History read bound to an id and its advertised timezone.
    History { id: HsRef, tz: Option<Arc<str>> },
}

/// Arguments supplied by the caller when invoking a bound action. Unused
/// fields are ignored by bindings that do not take them.
#[derive(Debug, Clone, Default)]
pub struct ActionArgs {
    pub value: Option<TreeValue>,
    pub level: Option<u8>,
    pub who: Option<String>,
    pub duration: Option<TreeValue>,
    pub range: Option<String>,
    /// Named parameters for `Invoke` bindings.
    pub named: HashMap<String, TreeValue>,
}

impl ActionArgs {
    pub fn with_value(value: TreeValue) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn with_range(range: impl Into<String>) -> Self {
        Self {
            range: Some(range.into()),
            ..Self::default()
        }
    }
}

/// Bindings keyed by the action node's path.
#[derive(Default)]
pub struct ActionRegistry {
    map: RwLock<HashMap<Arc<str>, ActionBinding>>,
}

impl ActionRegistry {
    pub fn register(&self, path: Arc<str>, binding: ActionBinding) {
        self.map.write().insert(path, binding);
    }

    pub fn get(&self, path: &str) -> Option<ActionBinding> {
        self.map.read().get(path).cloned()
    }

    /// Drop every binding at or under a path, for subtree removal.
    pub fn prune_prefix(&self, prefix: &str) {
        let nested = format!("{prefix}/");
        self.map
            .write()
            .retain(|path, _| path.as_ref() != prefix && !path.starts_with(&nested));
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

fn cast(kind: ValueKind, value: &TreeValue) -> BridgeResult<HsValue> {
    kind.coerce(value)
        .map_err(|e| BridgeError::Configuration(e.to_string()))
}

/// Execute a binding with the given arguments through the connection
/// manager's retry-classified call path.
pub async fn execute(
    manager: &Arc<ConnectionManager>,
    binding: &ActionBinding,
    args: &ActionArgs,
) -> BridgeResult<Grid> {
    match binding {
        ActionBinding::PointWrite { id, kind } => {
            let level = args.level.unwrap_or(DEFAULT_WRITE_LEVEL);
            if !(1..=17).contains(&level) {
                return Err(BridgeError::Configuration(format!(
                    "write level must be 1-17: {level}"
                )));
            }
            let val = match &args.value {
                Some(v) => Some(cast(*kind, v)?),
                None => None,
            };
            let duration = match &args.duration {
                Some(v) => Some(cast(ValueKind::Number, v)?),
                None => None,
            };
            let id = id.clone();
            let who = args.who.clone();
            debug!(id = %id, level, "point write");
            manager
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
        ActionBinding::Set { id, kind } => {
            let value = args
                .value
                .as_ref()
                .ok_or_else(|| BridgeError::Configuration("set requires a value".into()))?;
            let val = cast(*kind, value)?;
            let id = id.clone();
            debug!(id = %id, "set");
            manager
                .run_call(move |client| {
                    let id = id.clone();
                    let val = val.clone();
                    async move {
                        client
                            .point_write(&id, DEFAULT_WRITE_LEVEL, None, Some(val), None)
                            .await
                    }
                })
                .await
        }
        ActionBinding::Invoke { id, action, params } => {
            let mut call_args: Vec<(Arc<str>, HsValue)> = Vec::with_capacity(params.len());
            for (name, kind) in params {
                if let Some(value) = args.named.get(name.as_ref()) {
                    call_args.push((Arc::clone(name), cast(*kind, value)?));
                }
            }
            let id = id.clone();
            let action = Arc::clone(action);
            debug!(id = %id, action = %action, "invoking remote action");
            manager
                .run_call(move |client| {
                    let id = id.clone();
                    let action = Arc::clone(&action);
                    let call_args = call_args.clone();
                    async move { client.invoke_action(&id, &action, call_args).await }
                })
                .await
        }
        ActionBinding::History { id, tz } => {
            let range = args
                .range
                .clone()
                .unwrap_or_else(|| DEFAULT_HIS_RANGE.to_string());
            let id = id.clone();
            debug!(id = %id, range = %range, tz = tz.as_deref().unwrap_or(""), "history read");
            manager
                .run_call(move |client| {
                    let id = id.clone();
                    let range = range.clone();
                    async move { client.his_read(&id, &range).await }
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_prune_is_prefix_scoped() {
        let registry = ActionRegistry::default();
        let binding = ActionBinding::Set {
            id: HsRef::new("p.1"),
            kind: ValueKind::Number,
        };
        registry.register(Arc::from("/srv/a/set"), binding.clone());
        registry.register(Arc::from("/srv/a/pointWrite"), binding.clone());
        registry.register(Arc::from("/srv/ab/set"), binding);
        registry.prune_prefix("/srv/a");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("/srv/ab/set").is_some());
    }
}
