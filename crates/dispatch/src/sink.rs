//! Ordered, thread-safe result collection
//!
//! Workers finish tasks in any order; [`ResultSink`] writes each outcome into
//! the slot matching the task's submission index so the final
//! [`BatchResult`] is ordered deterministically.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::task::{BatchResult, Outcome, Task, TaskResult};

/// Recording errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("result index {index} out of range for batch of {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("result slot {index} already recorded")]
    AlreadyRecorded { index: usize },
}

/// A single recorded outcome, passed to progress reporters
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent<'a> {
    pub batch_id: Uuid,
    pub index: usize,
    pub task: &'a Task,
    pub outcome: &'a Outcome,
    /// Outcomes recorded so far, including this one
    pub completed: usize,
    pub total: usize,
}

/// Receives one event per recorded outcome
///
/// Called outside the sink's lock. A panicking reporter does not affect the
/// recording.
pub trait ProgressReporter: Send + Sync {
    fn on_record(&self, event: &ProgressEvent<'_>);
}

/// Logs progress through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn on_record(&self, event: &ProgressEvent<'_>) {
        if event.outcome.is_success() {
            info!(
                batch_id = %event.batch_id,
                task_id = event.task.task_id,
                owner_id = event.task.owner_id,
                completed = event.completed,
                total = event.total,
                "task recalculated"
            );
        } else {
            warn!(
                batch_id = %event.batch_id,
                task_id = event.task.task_id,
                owner_id = event.task.owner_id,
                status_code = %event.outcome.status_code,
                message = %event.outcome.message,
                completed = event.completed,
                total = event.total,
                "task failed"
            );
        }
    }
}

/// Reports nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_record(&self, _event: &ProgressEvent<'_>) {}
}

/// Pre-sized result slots for one batch
pub struct ResultSink {
    batch_id: Uuid,
    tasks: Vec<Task>,
    slots: Mutex<Vec<Option<Outcome>>>,
    completed: AtomicUsize,
    progress: Arc<dyn ProgressReporter>,
}

impl ResultSink {
    pub fn new(batch_id: Uuid, tasks: Vec<Task>, progress: Arc<dyn ProgressReporter>) -> Self {
        let slots = vec![None; tasks.len()];
        Self {
            batch_id,
            tasks,
            slots: Mutex::new(slots),
            completed: AtomicUsize::new(0),
            progress,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Number of outcomes recorded so far
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_recorded(&self, index: usize) -> bool {
        self.slots
            .lock()
            .get(index)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    /// Record the outcome of the task submitted at `index`
    ///
    /// Each slot accepts exactly one write.
    pub fn record(&self, index: usize, outcome: Outcome) -> Result<(), SinkError> {
        let completed = {
            let mut slots = self.slots.lock();
            let len = slots.len();
            let slot = slots
                .get_mut(index)
                .ok_or(SinkError::OutOfRange { index, len })?;
            if slot.is_some() {
                return Err(SinkError::AlreadyRecorded { index });
            }
            *slot = Some(outcome.clone());
            self.completed.fetch_add(1, Ordering::AcqRel) + 1
        };

        let event = ProgressEvent {
            batch_id: self.batch_id,
            index,
            task: &self.tasks[index],
            outcome: &outcome,
            completed,
            total: self.tasks.len(),
        };
        if catch_unwind(AssertUnwindSafe(|| self.progress.on_record(&event))).is_err() {
            warn!(batch_id = %self.batch_id, index, "progress reporter panicked");
        }

        Ok(())
    }

    /// Build the ordered result
    ///
    /// Slots that were never written are filled with the worker-lost
    /// sentinel so every task still has an outcome.
    pub fn finish(&self) -> BatchResult {
        let slots = std::mem::take(&mut *self.slots.lock());
        let entries = self
            .tasks
            .iter()
            .cloned()
            .zip(slots.into_iter().chain(std::iter::repeat(None)))
            .enumerate()
            .map(|(index, (task, outcome))| {
                let outcome = outcome.unwrap_or_else(|| {
                    warn!(batch_id = %self.batch_id, index, task_id = task.task_id, "no outcome recorded");
                    Outcome::worker_lost()
                });
                TaskResult { task, outcome }
            })
            .collect();

        BatchResult::from_entries(entries)
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("batch_id", &self.batch_id)
            .field("len", &self.tasks.len())
            .field("completed", &self.completed())
            .finish()
    }
}
