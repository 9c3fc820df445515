//! In-process simulated server.
//!
//! Implements the client traits against shared in-memory state so the engine
//! can be exercised end to end without a wire protocol: seed nav rows and
//! points, inject per-op faults, mutate values, and assert on call counters
//! and the server-side watch set.

use async_trait::async_trait;
use hs_bridge_sdk::{
    BridgeError, BridgeResult, ClientFactory, ConnectionConfig, Grid, HaystackClient,
    HaystackWatch, HsRef, HsValue, Row, OP_WATCH_SUB, PERMISSION_ERR_PREFIX,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

/// One-shot failure injected into the next call of a named op.
#[derive(Debug, Clone)]
pub enum SimFault {
    /// Permission error on an otherwise healthy session.
    Permission,
    /// HTTP redirect.
    Redirect,
    /// Transport failure.
    Network,
    /// Arbitrary server-side call error.
    Call(String),
}

impl SimFault {
    fn into_error(self) -> BridgeError {
        match self {
            Self::Permission => BridgeError::Call(format!("{PERMISSION_ERR_PREFIX}: denied")),
            Self::Redirect => BridgeError::Http {
                code: 303,
                message: "see other".into(),
            },
            Self::Network => BridgeError::Network("connection reset".into()),
            Self::Call(msg) => BridgeError::Call(msg),
        }
    }
}

/// Snapshot of the server's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub connects: u64,
    pub ops_calls: u64,
    pub nav_calls: u64,
    pub watch_opens: u64,
    pub sub_calls: u64,
    pub unsub_calls: u64,
    pub poll_calls: u64,
    pub point_writes: u64,
    pub invokes: u64,
    pub his_reads: u64,
    pub reads: u64,
    pub evals: u64,
}

#[derive(Default)]
struct AtomicCounters {
    connects: AtomicU64,
    ops_calls: AtomicU64,
    nav_calls: AtomicU64,
    watch_opens: AtomicU64,
    sub_calls: AtomicU64,
    unsub_calls: AtomicU64,
    poll_calls: AtomicU64,
    point_writes: AtomicU64,
    invokes: AtomicU64,
    his_reads: AtomicU64,
    reads: AtomicU64,
    evals: AtomicU64,
}

/// One recorded prioritized write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub id: HsRef,
    pub level: u8,
    pub who: Option<String>,
    pub val: Option<HsValue>,
    pub duration: Option<HsValue>,
}

/// One recorded remote action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRecord {
    pub id: HsRef,
    pub action: String,
    pub args: Vec<(Arc<str>, HsValue)>,
}

struct State {
    /// Nav rows keyed by the nav handle text; `None` is the root listing.
    nav: HashMap<Option<String>, Vec<Row>>,
    /// Current full row per point id.
    points: HashMap<HsRef, Row>,
    /// Ids changed since the last poll.
    dirty: HashSet<HsRef>,
    /// Server-side set of the current watch.
    watch_subs: HashSet<HsRef>,
    /// Pending one-shot faults per op name.
    faults: HashMap<String, VecDeque<SimFault>>,
    /// Seeded history rows returned by every his read.
    history: Vec<Row>,
    writes: Vec<WriteRecord>,
    invokes: Vec<InvokeRecord>,
    his_ranges: Vec<(HsRef, String)>,
    /// Op names in call order, for ordering assertions.
    op_log: Vec<String>,
}

/// Shared simulated server. Clone the `Arc` freely; every client opened by
/// the factory talks to the same state.
pub struct SimServer {
    state: Mutex<State>,
    counters: AtomicCounters,
    advertise_watch: AtomicBool,
    connect_failures: AtomicU32,
    watch_open: Arc<AtomicBool>,
}

impl SimServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                nav: HashMap::new(),
                points: HashMap::new(),
                dirty: HashSet::new(),
                watch_subs: HashSet::new(),
                faults: HashMap::new(),
                history: Vec::new(),
                writes: Vec::new(),
                invokes: Vec::new(),
                his_ranges: Vec::new(),
                op_log: Vec::new(),
            }),
            counters: AtomicCounters::default(),
            advertise_watch: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            watch_open: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ClientFactory> {
        Arc::new(SimClientFactory {
            server: Arc::clone(self),
        })
    }

    /// Toggle whether `ops` advertises watch support.
    pub fn advertise_watch(&self, on: bool) {
        self.advertise_watch.store(on, Ordering::Release);
    }

    /// Fail the next `n` connection attempts with a network error.
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::Release);
    }

    /// Queue a one-shot fault for the next call of the named op. Op names:
    /// `nav`, `read`, `eval`, `pointWrite`, `invokeAction`, `hisRead`,
    /// `watchPoll`, `watchSub`, `watchUnsub`, `ops`, or any raw op name.
    pub fn inject_fault(&self, op: &str, fault: SimFault) {
        self.state
            .lock()
            .faults
            .entry(op.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Seed the nav rows returned for a handle; `None` seeds the root.
    pub fn seed_nav(&self, handle: Option<&str>, rows: Vec<Row>) {
        self.state
            .lock()
            .nav
            .insert(handle.map(str::to_string), rows);
    }

    /// Seed or replace a point's full row.
    pub fn seed_point(&self, row: Row) {
        let Some(id) = row.id().cloned() else { return };
        self.state.lock().points.insert(id, row);
    }

    /// Seed the rows returned by history reads.
    pub fn seed_history(&self, rows: Vec<Row>) {
        self.state.lock().history = rows;
    }

    /// Replace a point's row and mark it changed for the next poll.
    pub fn update_point(&self, row: Row) {
        let Some(id) = row.id().cloned() else { return };
        let mut state = self.state.lock();
        state.points.insert(id.clone(), row);
        state.dirty.insert(id);
    }

    /// Update one cell of a point and mark it changed for the next poll.
    pub fn update_cell(&self, id: &HsRef, name: &str, value: HsValue) {
        let mut state = self.state.lock();
        if let Some(row) = state.points.get_mut(id) {
            row.set(name, value);
            state.dirty.insert(id.clone());
        }
    }

    /// Invalidate the current watch server-side.
    pub fn invalidate_watch(&self) {
        self.watch_open.store(false, Ordering::Release);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            connects: self.counters.connects.load(Ordering::Acquire),
            ops_calls: self.counters.ops_calls.load(Ordering::Acquire),
            nav_calls: self.counters.nav_calls.load(Ordering::Acquire),
            watch_opens: self.counters.watch_opens.load(Ordering::Acquire),
            sub_calls: self.counters.sub_calls.load(Ordering::Acquire),
            unsub_calls: self.counters.unsub_calls.load(Ordering::Acquire),
            poll_calls: self.counters.poll_calls.load(Ordering::Acquire),
            point_writes: self.counters.point_writes.load(Ordering::Acquire),
            invokes: self.counters.invokes.load(Ordering::Acquire),
            his_reads: self.counters.his_reads.load(Ordering::Acquire),
            reads: self.counters.reads.load(Ordering::Acquire),
            evals: self.counters.evals.load(Ordering::Acquire),
        }
    }

    /// The server-side watch set as of now.
    pub fn subscribed_ids(&self) -> HashSet<HsRef> {
        self.state.lock().watch_subs.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn invocations(&self) -> Vec<InvokeRecord> {
        self.state.lock().invokes.clone()
    }

    pub fn history_ranges(&self) -> Vec<(HsRef, String)> {
        self.state.lock().his_ranges.clone()
    }

    pub fn op_log(&self) -> Vec<String> {
        self.state.lock().op_log.clone()
    }

    fn log_op(&self, op: &str) {
        self.state.lock().op_log.push(op.to_string());
    }

    fn take_fault(&self, op: &str) -> Option<SimFault> {
        self.state
            .lock()
            .faults
            .get_mut(op)
            .and_then(VecDeque::pop_front)
    }

    fn check_fault(&self, op: &str) -> BridgeResult<()> {
        match self.take_fault(op) {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }
}

pub struct SimClientFactory {
    server: Arc<SimServer>,
}

#[async_trait]
impl ClientFactory for SimClientFactory {
    async fn open(&self, _config: &ConnectionConfig) -> BridgeResult<Arc<dyn HaystackClient>> {
        let remaining = self.server.connect_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.server
                .connect_failures
                .store(remaining - 1, Ordering::Release);
            return Err(BridgeError::Network("connection refused".into()));
        }
        self.server.counters.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(SimClient {
            server: Arc::clone(&self.server),
        }))
    }
}

pub struct SimClient {
    server: Arc<SimServer>,
}

impl SimClient {
    fn nav(&self, req: &Grid) -> BridgeResult<Grid> {
        self.server.counters.nav_calls.fetch_add(1, Ordering::AcqRel);
        let handle = req
            .first()
            .and_then(|row| row.get("navId"))
            .map(|v| match v {
                HsValue::Ref(r) => r.as_str().to_string(),
                other => other.to_string(),
            });
        let state = self.server.state.lock();
        let rows = state.nav.get(&handle).cloned().unwrap_or_default();
        Ok(Grid::from_rows(rows))
    }
}

#[async_trait]
impl HaystackClient for SimClient {
    async fn ops(&self) -> BridgeResult<Grid> {
        self.server.check_fault("ops")?;
        self.server.counters.ops_calls.fetch_add(1, Ordering::AcqRel);
        let mut grid = Grid::from_rows(vec![
            Row::new().with("name", HsValue::str("about")),
            Row::new().with("name", HsValue::str("nav")),
            Row::new().with("name", HsValue::str("read")),
        ]);
        if self.server.advertise_watch.load(Ordering::Acquire) {
            grid.push(Row::new().with("name", HsValue::str(OP_WATCH_SUB)));
        }
        Ok(grid)
    }

    async fn call(&self, op: &str, req: Grid) -> BridgeResult<Grid> {
        self.server.check_fault(op)?;
        match op {
            "nav" => self.nav(&req),
            other => Err(BridgeError::Call(format!("unsupported op: {other}"))),
        }
    }

    async fn read_all(&self, filter: &str, limit: Option<usize>) -> BridgeResult<Grid> {
        self.server.check_fault("read")?;
        self.server.counters.reads.fetch_add(1, Ordering::AcqRel);
        let state = self.server.state.lock();
        let mut rows: Vec<Row> = state
            .points
            .values()
            .filter(|row| filter == "point" || row.has(filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id().cmp(&b.id()));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(Grid::from_rows(rows))
    }

    async fn eval(&self, _expr: &str) -> BridgeResult<Grid> {
        self.server.check_fault("eval")?;
        self.server.counters.evals.fetch_add(1, Ordering::AcqRel);
        Ok(Grid::empty())
    }

    async fn point_write(
        &self,
        id: &HsRef,
        level: u8,
        who: Option<&str>,
        val: Option<HsValue>,
        duration: Option<HsValue>,
    ) -> BridgeResult<Grid> {
        self.server.check_fault("pointWrite")?;
        self.server
            .counters
            .point_writes
            .fetch_add(1, Ordering::AcqRel);
        let mut state = self.server.state.lock();
        state.writes.push(WriteRecord {
            id: id.clone(),
            level,
            who: who.map(str::to_string),
            val: val.clone(),
            duration,
        });
        if let (Some(row), Some(val)) = (state.points.get_mut(id), val) {
            row.set("curVal", val);
            state.dirty.insert(id.clone());
        }
        Ok(Grid::empty())
    }

    async fn invoke_action(
        &self,
        id: &HsRef,
        action: &str,
        args: Vec<(Arc<str>, HsValue)>,
    ) -> BridgeResult<Grid> {
        self.server.check_fault("invokeAction")?;
        self.server.counters.invokes.fetch_add(1, Ordering::AcqRel);
        self.server.state.lock().invokes.push(InvokeRecord {
            id: id.clone(),
            action: action.to_string(),
            args,
        });
        Ok(Grid::empty())
    }

    async fn his_read(&self, id: &HsRef, range: &str) -> BridgeResult<Grid> {
        self.server.check_fault("hisRead")?;
        self.server.counters.his_reads.fetch_add(1, Ordering::AcqRel);
        let mut state = self.server.state.lock();
        state.his_ranges.push((id.clone(), range.to_string()));
        Ok(Grid::from_rows(state.history.clone()))
    }

    async fn watch_open(&self, _dis: &str) -> BridgeResult<Arc<dyn HaystackWatch>> {
        self.server.check_fault(OP_WATCH_SUB)?;
        if !self.server.advertise_watch.load(Ordering::Acquire) {
            return Err(BridgeError::Call("watchSub not supported".into()));
        }
        self.server
            .counters
            .watch_opens
            .fetch_add(1, Ordering::AcqRel);
        self.server.state.lock().watch_subs.clear();
        self.server.watch_open.store(true, Ordering::Release);
        Ok(Arc::new(SimWatch {
            server: Arc::clone(&self.server),
            open: Arc::clone(&self.server.watch_open),
        }))
    }

    async fn close(&self) {
        self.server.watch_open.store(false, Ordering::Release);
    }
}

pub struct SimWatch {
    server: Arc<SimServer>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl HaystackWatch for SimWatch {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn sub(&self, ids: &[HsRef]) -> BridgeResult<()> {
        if !self.is_open() {
            return Err(BridgeError::WatchClosed);
        }
        self.server.check_fault("watchSub")?;
        self.server.log_op("watchSub");
        self.server.counters.sub_calls.fetch_add(1, Ordering::AcqRel);
        let mut state = self.server.state.lock();
        for id in ids {
            state.watch_subs.insert(id.clone());
        }
        Ok(())
    }

    async fn unsub(&self, ids: &[HsRef]) -> BridgeResult<()> {
        if !self.is_open() {
            return Err(BridgeError::WatchClosed);
        }
        self.server.check_fault("watchUnsub")?;
        self.server.log_op("watchUnsub");
        self.server
            .counters
            .unsub_calls
            .fetch_add(1, Ordering::AcqRel);
        let mut state = self.server.state.lock();
        for id in ids {
            state.watch_subs.remove(id);
        }
        Ok(())
    }

    async fn poll_changes(&self) -> BridgeResult<Grid> {
        if !self.is_open() {
            return Err(BridgeError::WatchClosed);
        }
        self.server.check_fault("watchPoll")?;
        self.server.counters.poll_calls.fetch_add(1, Ordering::AcqRel);
        let mut state = self.server.state.lock();
        let dirty = std::mem::take(&mut state.dirty);
        let rows: Vec<Row> = dirty
            .iter()
            .filter(|id| state.watch_subs.contains(id))
            .filter_map(|id| state.points.get(id).cloned())
            .collect();
        Ok(Grid::from_rows(rows))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.server.state.lock().watch_subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_failures_count_down() {
        let server = SimServer::new();
        server.fail_connects(2);
        let factory = server.factory();
        let config = ConnectionConfig::new("sim://demo");
        assert!(factory.open(&config).await.is_err());
        assert!(factory.open(&config).await.is_err());
        assert!(factory.open(&config).await.is_ok());
        assert_eq!(server.counters().connects, 1);
    }

    #[tokio::test]
    async fn poll_returns_only_dirty_subscribed_points() {
        let server = SimServer::new();
        let id = HsRef::new("p.1");
        server.seed_point(
            Row::new()
                .with("id", HsValue::Ref(id.clone()))
                .with("curVal", HsValue::num(1.0)),
        );
        let factory = server.factory();
        let client = factory
            .open(&ConnectionConfig::new("sim://demo"))
            .await
            .expect("open");
        let watch = client.watch_open("test").await.expect("watch");

        server.update_cell(&id, "curVal", HsValue::num(2.0));
        // Not subscribed yet: change is invisible.
        assert!(watch.poll_changes().await.expect("poll").is_empty());

        watch.sub(&[id.clone()]).await.expect("sub");
        server.update_cell(&id, "curVal", HsValue::num(3.0));
        let changes = watch.poll_changes().await.expect("poll");
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes.first().and_then(|r| r.get("curVal")).cloned(),
            Some(HsValue::num(3.0))
        );
        // Nothing new: next poll is empty.
        assert!(watch.poll_changes().await.expect("poll").is_empty());
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let server = SimServer::new();
        server.inject_fault("nav", SimFault::Permission);
        let client = server
            .factory()
            .open(&ConnectionConfig::new("sim://demo"))
            .await
            .expect("open");
        let err = client.call("nav", Grid::empty()).await.expect_err("fault");
        assert!(err.is_permission());
        assert!(client.call("nav", Grid::empty()).await.is_ok());
    }
}
