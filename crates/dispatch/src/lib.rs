//! # Recalculation Dispatch Engine
//!
//! Runs a batch of balance-recalculation tasks against a stored procedure
//! with bounded concurrency and collects one outcome per task.
//!
//! ## Features
//!
//! - **Bounded workers**: `min(task_count, max_concurrency)` workers share one task queue
//! - **Bounded connection pool**: lazy opens, validation on checkout, replacement of broken sessions
//! - **Ordered results**: outcomes land in submission order regardless of completion order
//! - **Localized failures**: infrastructure errors become sentinel status codes, never batch errors
//! - **Cancellation**: in-flight calls finish, pending tasks are recorded as cancelled
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (sizes the worker set, fills the task queue, waits)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Worker × N                                │
//! │  Idle → Acquiring → Invoking → Recording → Idle              │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                    │
//!          ▼                   ▼                    ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌─────────────────┐
//! │ ConnectionPool │  │ ProcedureInvoker │  │   ResultSink    │
//! │  (Connector)   │  │ (stored proc.)   │  │ (ordered slots) │
//! └────────────────┘  └──────────────────┘  └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use recalc_dispatch::prelude::*;
//!
//! let connector = PgConnector::from_url(&database_url)?;
//! let pool = ConnectionPool::new(connector, PoolConfig::new(8));
//! let dispatcher = Dispatcher::new(pool, PgProcedureInvoker::default(), DispatcherConfig::from_env());
//!
//! let tasks = vec![
//!     Task::parse(101, 5001, "2025-11-01")?,
//!     Task::parse(102, 5002, "2025-11-02")?,
//! ];
//! let result = dispatcher.run_batch(tasks).await?;
//! assert_eq!(result.len(), 2);
//! ```

pub mod connection;
pub mod dispatcher;
pub mod invoker;
pub mod memory;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sink;
pub mod task;
pub mod worker;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::connection::{ConnectError, Connector};
    pub use crate::dispatcher::{run_batch, DispatchError, Dispatcher, DispatcherConfig};
    pub use crate::invoker::{InvokeError, ProcedureInvoker, ProcedureOutput, DEFAULT_PROCEDURE};
    pub use crate::memory::{InMemoryConnector, InMemoryProcedure};
    pub use crate::pool::{ConnectionPool, PoolConfig, PoolError, PooledConnection};
    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnector, PgProcedureInvoker};
    pub use crate::sink::{NoProgress, ProgressReporter, TracingProgress};
    pub use crate::task::{
        BatchResult, BatchStatus, BatchSummary, EffectiveDate, Outcome, StatusCode, Task,
        TaskResult,
    };
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use connection::{ConnectError, Connector};
pub use dispatcher::{run_batch, DispatchError, Dispatcher, DispatcherConfig};
pub use invoker::{InvokeError, ProcedureInvoker, ProcedureOutput};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use sink::{ProgressEvent, ProgressReporter, ResultSink, SinkError};
pub use task::{
    BatchResult, BatchStatus, BatchSummary, EffectiveDate, Outcome, StatusCode, Task, TaskError,
    TaskResult,
};
pub use worker::{WorkerReport, WorkerState};
