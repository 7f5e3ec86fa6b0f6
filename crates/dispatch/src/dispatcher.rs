//! Batch dispatcher
//!
//! Fans a batch out to a fixed set of workers and fans the outcomes back in.
//! The worker count is `min(task_count, max_concurrency)`, so load on the
//! data store is bounded no matter how large the batch is.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connection::Connector;
use crate::invoker::ProcedureInvoker;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::serde_util::{duration_millis, env_parse, option_duration_millis};
use crate::sink::{ProgressReporter, ResultSink, TracingProgress};
use crate::task::{BatchResult, Outcome, Task};
use crate::worker::{TaskQueue, Worker};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Upper bound on concurrent workers
    pub max_concurrency: usize,

    /// How long a worker waits for a connection before giving up on a task
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Limit on a single procedure call; unlimited when unset
    #[serde(default, with = "option_duration_millis")]
    pub invoke_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            acquire_timeout: Duration::from_secs(30),
            invoke_timeout: None,
        }
    }
}

impl DispatcherConfig {
    /// Create configuration from environment variables
    ///
    /// - `RECALC_MAX_CONCURRENCY` (default: 10)
    /// - `RECALC_ACQUIRE_TIMEOUT_MS` (default: 30000)
    /// - `RECALC_INVOKE_TIMEOUT_MS` (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrency: env_parse("RECALC_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            acquire_timeout: env_parse("RECALC_ACQUIRE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
            invoke_timeout: env_parse("RECALC_INVOKE_TIMEOUT_MS").map(Duration::from_millis),
        }
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the connection acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the per-call timeout
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_concurrency == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.invoke_timeout == Some(Duration::ZERO) {
            return Err(DispatchError::InvalidConfig(
                "invoke_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Batch-level errors
///
/// Task-level failures never surface here; they are recorded in the task's
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
}

/// Runs batches of recalculation tasks
///
/// Holds the connection pool and invoker across batches. Each batch gets its
/// own worker set and result slots, so batches never share state beyond the
/// pool.
///
/// # Example
///
/// ```ignore
/// use recalc_dispatch::prelude::*;
///
/// let pool = ConnectionPool::new(InMemoryConnector::new(), PoolConfig::new(4));
/// let dispatcher = Dispatcher::new(pool, InMemoryProcedure::new(), DispatcherConfig::default());
///
/// let result = dispatcher.run_batch(tasks).await?;
/// for entry in &result {
///     println!("{} -> {}", entry.task.task_id, entry.outcome.status_code);
/// }
/// ```
pub struct Dispatcher<C: Connector, I> {
    pool: ConnectionPool<C>,
    invoker: Arc<I>,
    config: DispatcherConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl<C, I> Dispatcher<C, I>
where
    C: Connector,
    I: ProcedureInvoker<Connection = C::Connection>,
{
    pub fn new(pool: ConnectionPool<C>, invoker: I, config: DispatcherConfig) -> Self {
        Self {
            pool,
            invoker: Arc::new(invoker),
            config,
            progress: Arc::new(TracingProgress),
        }
    }

    /// Replace the default tracing progress reporter
    pub fn with_progress(mut self, progress: impl ProgressReporter + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Run a batch to completion
    pub async fn run_batch(&self, tasks: Vec<Task>) -> Result<BatchResult, DispatchError> {
        self.run_batch_with_cancel(tasks, CancellationToken::new())
            .await
    }

    /// Run a batch, stopping early when `cancel` fires
    ///
    /// In-flight calls finish and are recorded normally; tasks not yet
    /// started are recorded as cancelled. Returns only after every task has
    /// an outcome.
    #[instrument(skip_all, fields(batch_id = tracing::field::Empty, tasks = tasks.len()))]
    pub async fn run_batch_with_cancel(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<BatchResult, DispatchError> {
        self.config.validate()?;

        if tasks.is_empty() {
            debug!("empty batch");
            return Ok(BatchResult::default());
        }

        let batch_id = Uuid::now_v7();
        tracing::Span::current().record("batch_id", tracing::field::display(batch_id));

        let total = tasks.len();
        let worker_count = total.min(self.config.max_concurrency);
        let sink = Arc::new(ResultSink::new(
            batch_id,
            tasks,
            Arc::clone(&self.progress),
        ));
        let queue = TaskQueue::new(total);

        info!(
            total,
            workers = worker_count,
            pool_capacity = self.pool.config().max_size,
            "dispatching batch"
        );

        let handles: Vec<_> = (0..worker_count)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    self.pool.clone(),
                    Arc::clone(&self.invoker),
                    Arc::clone(&sink),
                    queue.clone(),
                    cancel.clone(),
                    self.config.acquire_timeout,
                    self.config.invoke_timeout,
                );
                tokio::spawn(worker.run())
            })
            .collect();

        for joined in join_all(handles).await {
            match joined {
                Ok(report) => {
                    debug!(
                        worker_id = report.worker_id,
                        processed = report.processed,
                        "worker joined"
                    );
                }
                Err(e) => {
                    error!(error = %e, "worker terminated abnormally");
                }
            }
        }

        // Only reachable if every worker died before the queue emptied
        let stranded = queue.drain().await;
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "tasks left in queue after workers exited");
            for index in stranded {
                if let Err(e) = sink.record(index, Outcome::worker_lost()) {
                    warn!(index, error = %e, "failed to record stranded task");
                }
            }
        }

        let result = sink.finish();
        let summary = result.summary();
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch complete"
        );

        Ok(result)
    }

    /// Close the connection pool
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// Run one batch on a dedicated pool of `concurrency` connections
///
/// The pool is closed before returning.
pub async fn run_batch<C, I>(
    connector: C,
    invoker: I,
    tasks: Vec<Task>,
    concurrency: usize,
    acquire_timeout: Duration,
) -> Result<BatchResult, DispatchError>
where
    C: Connector,
    I: ProcedureInvoker<Connection = C::Connection>,
{
    let config = DispatcherConfig::default()
        .with_max_concurrency(concurrency)
        .with_acquire_timeout(acquire_timeout);
    config.validate()?;

    let pool = ConnectionPool::new(
        connector,
        PoolConfig::new(concurrency).with_acquire_timeout(acquire_timeout),
    );
    let dispatcher = Dispatcher::new(pool, invoker, config);
    let result = dispatcher.run_batch(tasks).await;
    dispatcher.shutdown().await;
    result
}
