//! Stored-procedure invocation boundary
//!
//! The recalculation procedure has a fixed signature:
//!
//! ```text
//! recalculate_balance(
//!     task_id        IN  numeric,
//!     owner_id       IN  numeric,
//!     effective_date IN  date     -- from 'YYYY-MM-DD'
//!     status         OUT numeric,
//!     message        OUT text     -- up to 256 bytes
//! )
//! ```
//!
//! A non-zero `status` is a business failure and is returned as data.
//! [`InvokeError`] is reserved for calls that could not complete.

use async_trait::async_trait;

use crate::task::{truncate_message, Outcome, StatusCode, Task};

/// Default procedure name
pub const DEFAULT_PROCEDURE: &str = "recalculate_balance";

/// Output parameters read back after a successful call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureOutput {
    pub status: i32,
    pub message: String,
}

impl ProcedureOutput {
    /// Build output, truncating the message to the procedure's buffer size
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_message(&mut message);
        Self { status, message }
    }

    pub fn success() -> Self {
        Self::new(0, "")
    }

    pub fn into_outcome(self) -> Outcome {
        Outcome::new(StatusCode(self.status), self.message)
    }
}

/// Infrastructure failure during a procedure call
///
/// The connection the call ran on is assumed broken after any of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    /// Parameters could not be bound
    #[error("failed to bind parameters: {0}")]
    Bind(String),

    /// Connection dropped or the driver failed mid-call
    #[error("database error: {0}")]
    Database(String),

    /// The invoker itself is misconfigured, e.g. an unusable procedure name
    #[error("invalid invoker configuration: {0}")]
    Configuration(String),

    /// Output parameters missing or of the wrong type
    #[error("unexpected procedure output: {0}")]
    Output(String),

    /// The call did not finish within the configured limit
    #[error("procedure call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Calls the recalculation procedure for a single task
///
/// Binds the task's identifier, owner identifier and effective date (as
/// `YYYY-MM-DD`) as inputs, executes the call on the given connection and
/// reads the status and message outputs.
#[async_trait]
pub trait ProcedureInvoker: Send + Sync + 'static {
    /// Connection type this invoker runs on
    type Connection: Send + 'static;

    async fn call(
        &self,
        conn: &mut Self::Connection,
        task: &Task,
    ) -> Result<ProcedureOutput, InvokeError>;
}

/// Whether `name` is safe to splice into a call statement
///
/// Accepts an optional schema prefix: `schema.procedure`. Each part must
/// start with a letter or underscore and contain only ASCII alphanumerics
/// and underscores.
pub fn is_valid_procedure_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }

    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}
