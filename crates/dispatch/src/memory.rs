//! In-memory connector and procedure
//!
//! Mirrors the behaviour of a real database driver closely enough to
//! exercise the pool and dispatcher without one. Used by tests and by the
//! engine's dry-run mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{ConnectError, Connector};
use crate::invoker::{InvokeError, ProcedureInvoker, ProcedureOutput};
use crate::task::Task;

/// Session handed out by [`InMemoryConnector`]
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    broken: bool,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate the server dropping this session
    pub fn break_session(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

#[derive(Default)]
struct ConnectorState {
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_open: AtomicBool,
    open_broken: AtomicBool,
}

/// In-memory [`Connector`]
///
/// Clones share counters, so a test can keep a handle after moving the
/// connector into a pool.
///
/// # Example
///
/// ```
/// use recalc_dispatch::memory::InMemoryConnector;
///
/// let connector = InMemoryConnector::new();
/// assert_eq!(connector.opened(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    state: Arc<ConnectorState>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened so far
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of connections closed so far
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Make every subsequent `open` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Hand out sessions that are already dead when opened
    pub fn set_open_broken(&self, broken: bool) {
        self.state.open_broken.store(broken, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Connection = InMemoryConnection;

    async fn open(&self) -> Result<InMemoryConnection, ConnectError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectError::Connect("in-memory store unavailable".into()));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            id,
            broken: self.state.open_broken.load(Ordering::SeqCst),
        })
    }

    async fn validate(&self, conn: &mut InMemoryConnection) -> bool {
        !conn.broken
    }

    async fn close(&self, _conn: InMemoryConnection) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted response for a task
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Procedure runs and reports this status and message
    Status(i32, String),
    /// The call fails and the session is dropped
    Fail(String),
}

type Responder = Arc<dyn Fn(&Task) -> ScriptedResponse + Send + Sync>;

#[derive(Default)]
struct ProcedureStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shared_connection_uses: AtomicUsize,
    connections_in_use: Mutex<HashSet<u64>>,
    calls_per_task: Mutex<HashMap<i64, usize>>,
}

/// In-memory recalculation procedure
///
/// Succeeds for every task unless told otherwise. Tracks concurrency so
/// tests can check that load stays within the pool's bounds and that no
/// connection is used by two calls at once.
#[derive(Clone)]
pub struct InMemoryProcedure {
    responder: Responder,
    overrides: Arc<HashMap<i64, ScriptedResponse>>,
    latency: Duration,
    stats: Arc<ProcedureStats>,
}

impl Default for InMemoryProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProcedure {
    /// A procedure that reports success for every task
    pub fn new() -> Self {
        Self {
            responder: Arc::new(|_| ScriptedResponse::Status(0, String::new())),
            overrides: Arc::new(HashMap::new()),
            latency: Duration::ZERO,
            stats: Arc::new(ProcedureStats::default()),
        }
    }

    /// Compute the response for every task not overridden by `with_status`/`with_failure`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Task) -> ScriptedResponse + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Report `status` and `message` for one task
    pub fn with_status(self, task_id: i64, status: i32, message: impl Into<String>) -> Self {
        self.with_override(task_id, ScriptedResponse::Status(status, message.into()))
    }

    /// Fail the call for one task
    pub fn with_failure(self, task_id: i64, error: impl Into<String>) -> Self {
        self.with_override(task_id, ScriptedResponse::Fail(error.into()))
    }

    /// Simulated round-trip time per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_override(mut self, task_id: i64, response: ScriptedResponse) -> Self {
        Arc::make_mut(&mut self.overrides).insert(task_id, response);
        self
    }

    /// Total calls made
    pub fn calls(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }

    /// Calls made for one task
    pub fn calls_for(&self, task_id: i64) -> usize {
        self.stats
            .calls_per_task
            .lock()
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls that started on a connection another call was still using
    pub fn shared_connection_uses(&self) -> usize {
        self.stats.shared_connection_uses.load(Ordering::SeqCst)
    }

    fn respond(&self, task: &Task) -> ScriptedResponse {
        match self.overrides.get(&task.task_id) {
            Some(response) => response.clone(),
            None => (self.responder)(task),
        }
    }
}

/// Marks a call as finished even if the caller stops polling it
struct InFlight<'a> {
    stats: &'a ProcedureStats,
    connection_id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stats
            .connections_in_use
            .lock()
            .remove(&self.connection_id);
    }
}

#[async_trait]
impl ProcedureInvoker for InMemoryProcedure {
    type Connection = InMemoryConnection;

    async fn call(
        &self,
        conn: &mut InMemoryConnection,
        task: &Task,
    ) -> Result<ProcedureOutput, InvokeError> {
        if conn.broken {
            return Err(InvokeError::Database("connection reset by peer".into()));
        }

        let stats: &ProcedureStats = &self.stats;
        stats.calls.fetch_add(1, Ordering::SeqCst);
        *stats.calls_per_task.lock().entry(task.task_id).or_insert(0) += 1;

        if !stats.connections_in_use.lock().insert(conn.id) {
            stats.shared_connection_uses.fetch_add(1, Ordering::SeqCst);
        }
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight {
            stats,
            connection_id: conn.id,
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        match self.respond(task) {
            ScriptedResponse::Status(status, message) => Ok(ProcedureOutput::new(status, message)),
            ScriptedResponse::Fail(error) => {
                conn.break_session();
                Err(InvokeError::Database(error))
            }
        }
    }
}
