//! Per-task worker state machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!  Idle ─▶ Acquiring ─▶ Invoking ─▶ Recording ──────────────┘
//!   │          │                        ▲
//!   │          └── acquire failed ──────┘
//!   └─▶ Draining   (queue empty)
//! ```
//!
//! A worker pulls task indices from a shared [`TaskQueue`] until it is empty.
//! Every task it pulls is recorded exactly once, whatever happens to the
//! call. Connections are released before recording.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::connection::Connector;
use crate::invoker::{InvokeError, ProcedureInvoker, ProcedureOutput};
use crate::pool::ConnectionPool;
use crate::sink::ResultSink;
use crate::task::{Outcome, Task};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next task
    Idle,
    /// Waiting for a connection
    Acquiring,
    /// Procedure call in flight
    Invoking,
    /// Writing the outcome
    Recording,
    /// Queue exhausted, worker exiting
    Draining,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Acquiring => "acquiring",
            WorkerState::Invoking => "invoking",
            WorkerState::Recording => "recording",
            WorkerState::Draining => "draining",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared source of task indices for one batch
///
/// Filled once with every index in submission order; workers take from it
/// until it is empty.
#[derive(Clone)]
pub struct TaskQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<usize>>>,
}

impl TaskQueue {
    /// Queue holding indices `0..len`
    pub fn new(len: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for index in 0..len {
            // The receiver is alive, so this cannot fail
            let _ = tx.send(index);
        }
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next index, or `None` once the queue is empty
    pub async fn next(&self) -> Option<usize> {
        self.rx.lock().await.recv().await
    }

    /// Take every index still queued
    pub async fn drain(&self) -> Vec<usize> {
        let mut rx = self.rx.lock().await;
        let mut remaining = Vec::new();
        while let Ok(index) = rx.try_recv() {
            remaining.push(index);
        }
        remaining
    }
}

/// What a worker did before it exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    /// Tasks this worker recorded
    pub processed: usize,
    pub state: WorkerState,
}

/// One unit of concurrent execution
pub struct Worker<C: Connector, I> {
    id: usize,
    pool: ConnectionPool<C>,
    invoker: Arc<I>,
    sink: Arc<ResultSink>,
    queue: TaskQueue,
    cancel: CancellationToken,
    acquire_timeout: Duration,
    invoke_timeout: Option<Duration>,
    state: WorkerState,
}

impl<C, I> Worker<C, I>
where
    C: Connector,
    I: ProcedureInvoker<Connection = C::Connection>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        pool: ConnectionPool<C>,
        invoker: Arc<I>,
        sink: Arc<ResultSink>,
        queue: TaskQueue,
        cancel: CancellationToken,
        acquire_timeout: Duration,
        invoke_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            pool,
            invoker,
            sink,
            queue,
            cancel,
            acquire_timeout,
            invoke_timeout,
            state: WorkerState::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Process tasks until the queue is empty
    #[instrument(name = "worker", skip_all, fields(worker_id = self.id, batch_id = %self.sink.batch_id()))]
    pub async fn run(mut self) -> WorkerReport {
        let mut processed = 0;

        while let Some(index) = self.queue.next().await {
            let Some(task) = self.sink.task(index).cloned() else {
                warn!(index, "queued index has no task");
                continue;
            };

            let outcome = self.process(&task).await;

            self.transition(WorkerState::Recording);
            if let Err(e) = self.sink.record(index, outcome) {
                warn!(index, task_id = task.task_id, error = %e, "failed to record outcome");
            }
            processed += 1;
            self.transition(WorkerState::Idle);
        }

        self.transition(WorkerState::Draining);
        debug!(processed, "worker finished");

        WorkerReport {
            worker_id: self.id,
            processed,
            state: self.state,
        }
    }

    async fn process(&mut self, task: &Task) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::cancelled();
        }

        self.transition(WorkerState::Acquiring);
        let acquired = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::cancelled(),
            result = self.pool.acquire_timeout(self.acquire_timeout) => result,
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                debug!(task_id = task.task_id, error = %e, "connection unavailable");
                return Outcome::connection_unavailable(e);
            }
        };

        self.transition(WorkerState::Invoking);
        let outcome = match self.invoke(&mut *conn, task).await {
            Ok(output) => output.into_outcome(),
            Err(e) => {
                warn!(task_id = task.task_id, error = %e, "procedure invocation failed");
                conn.invalidate();
                Outcome::invocation_failed(e)
            }
        };
        self.pool.release(conn);

        outcome
    }

    async fn invoke(
        &self,
        conn: &mut C::Connection,
        task: &Task,
    ) -> Result<ProcedureOutput, InvokeError> {
        match self.invoke_timeout {
            Some(limit) => tokio::time::timeout(limit, self.invoker.call(conn, task))
                .await
                .unwrap_or(Err(InvokeError::Timeout(limit))),
            None => self.invoker.call(conn, task).await,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        trace!(from = %self.state, to = %next, "worker state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryConnector, InMemoryProcedure};
    use crate::pool::PoolConfig;
    use crate::sink::NoProgress;
    use crate::task::StatusCode;
    use uuid::Uuid;

    fn tasks(n: i64) -> Vec<Task> {
        (1..=n)
            .map(|i| Task::parse(i, 500 + i, "2025-11-01").unwrap())
            .collect()
    }

    fn worker(
        pool_size: usize,
        procedure: InMemoryProcedure,
        n: i64,
        cancel: CancellationToken,
        invoke_timeout: Option<Duration>,
    ) -> (Worker<InMemoryConnector, InMemoryProcedure>, Arc<ResultSink>) {
        let pool = ConnectionPool::new(InMemoryConnector::new(), PoolConfig::new(pool_size));
        let sink = Arc::new(ResultSink::new(
            Uuid::now_v7(),
            tasks(n),
            Arc::new(NoProgress),
        ));
        let worker = Worker::new(
            0,
            pool,
            Arc::new(procedure),
            Arc::clone(&sink),
            TaskQueue::new(n as usize),
            cancel,
            Duration::from_millis(20),
            invoke_timeout,
        );
        (worker, sink)
    }

    #[tokio::test]
    async fn test_queue_yields_every_index_once() {
        let queue = TaskQueue::new(3);
        assert_eq!(queue.next().await, Some(0));
        assert_eq!(queue.drain().await, vec![1, 2]);
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_worker_processes_whole_queue() {
        let procedure = InMemoryProcedure::new().with_status(2, 4, "owner locked");
        let (worker, sink) = worker(1, procedure, 3, CancellationToken::new(), None);
        assert_eq!(worker.state(), WorkerState::Idle);

        let report = worker.run().await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.state, WorkerState::Draining);

        let result = sink.finish();
        let codes: Vec<_> = result.iter().map(|e| e.outcome.status_code).collect();
        assert_eq!(codes, vec![StatusCode(0), StatusCode(4), StatusCode(0)]);
        assert_eq!(result.entries()[1].outcome.message, "owner locked");
    }

    #[tokio::test]
    async fn test_acquire_failure_records_connection_unavailable() {
        let (worker, sink) = worker(0, InMemoryProcedure::new(), 2, CancellationToken::new(), None);
        worker.run().await;

        let result = sink.finish();
        assert!(result
            .iter()
            .all(|e| e.outcome.status_code == StatusCode::CONNECTION_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_invocation_failure_records_sentinel_and_continues() {
        let procedure = InMemoryProcedure::new().with_failure(1, "server closed the connection");
        let (worker, sink) = worker(1, procedure.clone(), 3, CancellationToken::new(), None);
        worker.run().await;

        let result = sink.finish();
        let first = &result.entries()[0].outcome;
        assert_eq!(first.status_code, StatusCode::INVOCATION_FAILED);
        assert!(first.message.contains("server closed the connection"));
        assert!(result.entries()[1].outcome.is_success());
        assert!(result.entries()[2].outcome.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_worker_records_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let procedure = InMemoryProcedure::new();
        let (worker, sink) = worker(1, procedure.clone(), 4, cancel, None);

        let report = worker.run().await;
        assert_eq!(report.processed, 4);
        assert_eq!(procedure.calls(), 0);
        assert!(sink
            .finish()
            .iter()
            .all(|e| e.outcome.status_code == StatusCode::CANCELLED));
    }

    #[tokio::test]
    async fn test_invoke_timeout_records_invocation_failed() {
        let procedure = InMemoryProcedure::new().with_latency(Duration::from_millis(200));
        let (worker, sink) = worker(
            1,
            procedure,
            1,
            CancellationToken::new(),
            Some(Duration::from_millis(10)),
        );
        worker.run().await;

        let result = sink.finish();
        let outcome = &result.entries()[0].outcome;
        assert_eq!(outcome.status_code, StatusCode::INVOCATION_FAILED);
        assert!(outcome.message.contains("timed out"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Acquiring.to_string(), "acquiring");
        assert_eq!(WorkerState::Draining.as_str(), "draining");
    }
}
