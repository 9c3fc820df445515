use crate::{
    config::ConnectionConfig,
    error::BridgeResult,
    grid::Grid,
    value::{HsRef, HsValue},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Name of the advertised op that signals watch support.
pub const OP_WATCH_SUB: &str = "watchSub";

/// An authenticated session against the remote server.
///
/// Implementations own the wire protocol; the engine treats this as an opaque
/// request/response surface obtained from the connection manager and never
/// cached across calls.
#[async_trait]
pub trait HaystackClient: Send + Sync {
    /// List the ops the server advertises. Called once at connect time to
    /// detect watch support.
    async fn ops(&self) -> BridgeResult<Grid>;

    async fn call(&self, op: &str, req: Grid) -> BridgeResult<Grid>;

    async fn read_all(&self, filter: &str, limit: Option<usize>) -> BridgeResult<Grid>;

    async fn eval(&self, expr: &str) -> BridgeResult<Grid>;

    /// Prioritized-array write: numeric level 1-17, optional actor, value and
    /// expiry duration.
    async fn point_write(
        &self,
        id: &HsRef,
        level: u8,
        who: Option<&str>,
        val: Option<HsValue>,
        duration: Option<HsValue>,
    ) -> BridgeResult<Grid>;

    /// Invoke a named remote action with id-bound arguments.
    async fn invoke_action(
        &self,
        id: &HsRef,
        action: &str,
        args: Vec<(Arc<str>, HsValue)>,
    ) -> BridgeResult<Grid>;

    /// Read history rollups for an entity over a range expression.
    async fn his_read(&self, id: &HsRef, range: &str) -> BridgeResult<Grid>;

    async fn watch_open(&self, dis: &str) -> BridgeResult<Arc<dyn HaystackWatch>>;

    /// Best-effort session teardown.
    async fn close(&self);
}

/// A server-side subscription session.
#[async_trait]
pub trait HaystackWatch: Send + Sync {
    fn is_open(&self) -> bool;

    async fn sub(&self, ids: &[HsRef]) -> BridgeResult<()>;

    async fn unsub(&self, ids: &[HsRef]) -> BridgeResult<()>;

    /// Poll the changed rows since the previous poll.
    async fn poll_changes(&self) -> BridgeResult<Grid>;

    async fn close(&self);
}

/// Opens authenticated sessions. Injected into the connection manager so the
/// transport stays swappable (simulator in tests, HTTP in deployments).
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> BridgeResult<Arc<dyn HaystackClient>>;
}
