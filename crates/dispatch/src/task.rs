//! Tasks, outcomes, and batch results
//!
//! A [`Task`] is one recalculation request. After processing, every task is
//! paired with exactly one [`Outcome`] in a [`BatchResult`], in the order the
//! tasks were submitted.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Textual form of an effective date at the invocation boundary
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Maximum length of an outcome message in bytes
pub const MESSAGE_MAX_BYTES: usize = 256;

/// Errors raised while building tasks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Effective date was not a valid `YYYY-MM-DD` calendar date
    #[error("invalid effective date {value:?}: expected YYYY-MM-DD")]
    InvalidDate { value: String },
}

/// Calendar date a recalculation takes effect on
///
/// Always a valid date; serialized as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectiveDate(NaiveDate);

impl EffectiveDate {
    /// Wrap an already valid date
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Parse a `YYYY-MM-DD` string
    ///
    /// Only four-digit years from `0001` and zero-padded months and days are
    /// accepted, so `2025-1-5`, ` 2025-1-01` and `+999-01-01` are rejected.
    pub fn parse(value: &str) -> Result<Self, TaskError> {
        let invalid = || TaskError::InvalidDate {
            value: value.to_string(),
        };

        if !has_date_shape(value) || value.starts_with("0000") {
            return Err(invalid());
        }

        NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(Self)
            .map_err(|_| invalid())
    }

    /// The underlying date
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

/// `DDDD-DD-DD` with ASCII digits; chrono alone tolerates signs and padding
fn has_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

impl fmt::Display for EffectiveDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for EffectiveDate {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<NaiveDate> for EffectiveDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl Serialize for EffectiveDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EffectiveDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One unit of recalculation work
///
/// Immutable once submitted to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier of the change being recalculated
    #[serde(alias = "novelty_id")]
    pub task_id: i64,
    /// Entity whose balance is recalculated
    #[serde(alias = "user_id")]
    pub owner_id: i64,
    /// Date the change takes effect
    pub effective_date: EffectiveDate,
}

impl Task {
    /// Create a task
    pub fn new(task_id: i64, owner_id: i64, effective_date: impl Into<EffectiveDate>) -> Self {
        Self {
            task_id,
            owner_id,
            effective_date: effective_date.into(),
        }
    }

    /// Create a task from a `YYYY-MM-DD` date string
    pub fn parse(task_id: i64, owner_id: i64, effective_date: &str) -> Result<Self, TaskError> {
        Ok(Self {
            task_id,
            owner_id,
            effective_date: EffectiveDate::parse(effective_date)?,
        })
    }
}

/// Status code attached to an outcome
///
/// `0` is success. Any other value returned by the procedure is a business
/// failure. A few negative values are reserved for infrastructure failures
/// raised by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0);
    /// No connection could be acquired (exhausted, closed, or failed to open)
    pub const CONNECTION_UNAVAILABLE: Self = Self(-1);
    /// Batch was cancelled before the task started
    pub const CANCELLED: Self = Self(-2);
    /// Worker terminated before recording the task
    pub const WORKER_LOST: Self = Self(-98);
    /// The procedure call itself failed
    pub const INVOCATION_FAILED: Self = Self(-99);

    const RESERVED: [Self; 4] = [
        Self::CONNECTION_UNAVAILABLE,
        Self::CANCELLED,
        Self::WORKER_LOST,
        Self::INVOCATION_FAILED,
    ];

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether this code is one of the engine's reserved sentinels
    pub fn is_sentinel(self) -> bool {
        Self::RESERVED.contains(&self)
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for StatusCode {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Result of processing one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status_code: StatusCode,
    pub message: String,
}

impl Outcome {
    /// Outcome reported by the procedure, message truncated to [`MESSAGE_MAX_BYTES`]
    pub fn new(status_code: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_message(&mut message);
        Self {
            status_code: status_code.into(),
            message,
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::SUCCESS, "")
    }

    pub fn connection_unavailable(reason: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::CONNECTION_UNAVAILABLE,
            format!("could not acquire database connection: {reason}"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::CANCELLED, "batch cancelled before task started")
    }

    pub fn worker_lost() -> Self {
        Self::new(
            StatusCode::WORKER_LOST,
            "worker terminated before recording an outcome",
        )
    }

    pub fn invocation_failed(reason: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::INVOCATION_FAILED,
            format!("procedure invocation failed: {reason}"),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}

/// Truncate a message in place to [`MESSAGE_MAX_BYTES`], respecting UTF-8 boundaries
pub fn truncate_message(message: &mut String) {
    if message.len() <= MESSAGE_MAX_BYTES {
        return;
    }
    let mut end = MESSAGE_MAX_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

/// A task paired with its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(flatten)]
    pub task: Task,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Overall status of a finished batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every task succeeded
    Success,
    /// At least one task failed
    PartialFailure,
}

/// Counts over a finished batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Ordered results of a batch, one entry per submitted task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchResult {
    entries: Vec<TaskResult>,
}

impl BatchResult {
    pub(crate) fn from_entries(entries: Vec<TaskResult>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in submission order
    pub fn entries(&self) -> &[TaskResult] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskResult> {
        self.entries.iter()
    }

    /// Entries whose outcome is not a success
    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.entries.iter().filter(|e| !e.outcome.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.outcome.is_success())
    }

    pub fn summary(&self) -> BatchSummary {
        let total = self.entries.len();
        let failed = self.failed().count();
        BatchSummary {
            status: if failed == 0 {
                BatchStatus::Success
            } else {
                BatchStatus::PartialFailure
            },
            total,
            succeeded: total - failed,
            failed,
        }
    }

    pub fn into_entries(self) -> Vec<TaskResult> {
        self.entries
    }
}

impl IntoIterator for BatchResult {
    type Item = TaskResult;
    type IntoIter = std::vec::IntoIter<TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a BatchResult {
    type Item = &'a TaskResult;
    type IntoIter = std::slice::Iter<'a, TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effective_date_parse() {
        let date = EffectiveDate::parse("2025-11-01").unwrap();
        assert_eq!(date.date(), NaiveDate::from_ymd_opt(2025, 11, 1).unwrap());
        assert_eq!(date.to_string(), "2025-11-01");
    }

    #[test]
    fn test_effective_date_rejects_malformed() {
        for raw in [
            "2025-13-01",
            "2025-02-30",
            "2025-1-5",
            "01/11/2025",
            "",
            "2025-11-01T00:00",
            " 2025-1-01",
            "2025- 1-01",
            "2025-01- 1",
            "-999-01-01",
            "+999-01-01",
            "0000-01-01",
            "2025-11-０1",
        ] {
            assert!(
                matches!(EffectiveDate::parse(raw), Err(TaskError::InvalidDate { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_effective_date_round_trips_as_written() {
        for raw in ["0001-01-01", "0999-12-31", "2024-02-29", "9999-12-31"] {
            assert_eq!(EffectiveDate::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_task_deserialize() {
        let task: Task = serde_json::from_value(json!({
            "task_id": 101,
            "owner_id": 5001,
            "effective_date": "2025-11-01"
        }))
        .unwrap();

        assert_eq!(task, Task::parse(101, 5001, "2025-11-01").unwrap());
    }

    #[test]
    fn test_task_deserialize_backend_field_names() {
        let task: Task = serde_json::from_value(json!({
            "novelty_id": 7,
            "user_id": 42,
            "effective_date": "2025-01-31"
        }))
        .unwrap();

        assert_eq!(task, Task::parse(7, 42, "2025-01-31").unwrap());
    }

    #[test]
    fn test_task_deserialize_rejects_bad_date() {
        let result: Result<Task, _> = serde_json::from_value(json!({
            "task_id": 101,
            "owner_id": 5001,
            "effective_date": "2025-11-31"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_sentinels_are_distinct() {
        let codes = StatusCode::RESERVED;
        for (i, a) in codes.iter().enumerate() {
            assert!(a.is_sentinel());
            assert!(!a.is_success());
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(!StatusCode(7).is_sentinel());
        assert!(!StatusCode::SUCCESS.is_sentinel());
    }

    #[test]
    fn test_outcome_message_truncated_on_char_boundary() {
        let long = "é".repeat(200); // 400 bytes
        let outcome = Outcome::new(StatusCode(3), long);
        assert!(outcome.message.len() <= MESSAGE_MAX_BYTES);
        assert_eq!(outcome.message.len(), MESSAGE_MAX_BYTES);
        assert!(outcome.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_task_result_serializes_flat() {
        let entry = TaskResult {
            task: Task::parse(102, 5002, "2025-11-02").unwrap(),
            outcome: Outcome::new(StatusCode(4), "no balance"),
        };

        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "task_id": 102,
                "owner_id": 5002,
                "effective_date": "2025-11-02",
                "status_code": 4,
                "message": "no balance"
            })
        );
    }

    #[test]
    fn test_batch_summary() {
        let result = BatchResult::from_entries(vec![
            TaskResult {
                task: Task::parse(1, 10, "2025-01-01").unwrap(),
                outcome: Outcome::success(),
            },
            TaskResult {
                task: Task::parse(2, 20, "2025-01-02").unwrap(),
                outcome: Outcome::new(StatusCode(5), "locked"),
            },
            TaskResult {
                task: Task::parse(3, 30, "2025-01-03").unwrap(),
                outcome: Outcome::cancelled(),
            },
        ]);

        let summary = result.summary();
        assert_eq!(summary.status, BatchStatus::PartialFailure);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert!(!result.is_success());
        assert_eq!(
            result.failed().map(|e| e.task.task_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_empty_batch_is_success() {
        let result = BatchResult::default();
        assert!(result.is_success());
        assert_eq!(result.summary().status, BatchStatus::Success);
    }
}
