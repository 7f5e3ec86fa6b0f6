//! PostgreSQL connector and procedure invoker
//!
//! Each pooled connection is a dedicated `PgConnection`; the engine's own
//! [`ConnectionPool`](crate::pool::ConnectionPool) does the pooling.
//!
//! The procedure is called with bound inputs
//!
//! ```sql
//! CALL recalculate_balance($1, $2, $3::date, NULL, NULL)
//! ```
//!
//! and PostgreSQL returns the OUT parameters as a single row. They are read
//! by position, so the procedure may name them freely. The status may be
//! declared `numeric` or any integer type.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use tracing::{debug, instrument};

use crate::connection::{ConnectError, Connector};
use crate::invoker::{
    is_valid_procedure_name, InvokeError, ProcedureInvoker, ProcedureOutput, DEFAULT_PROCEDURE,
};
use crate::task::Task;

/// Opens dedicated PostgreSQL sessions
///
/// # Example
///
/// ```ignore
/// use recalc_dispatch::postgres::PgConnector;
///
/// let connector = PgConnector::from_url("postgres://localhost/payroll")?;
/// ```
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    /// Parse a `postgres://` URL
    pub fn from_url(url: &str) -> Result<Self, ConnectError> {
        let options = url
            .parse::<PgConnectOptions>()
            .map_err(|e| ConnectError::Configuration(e.to_string()))?;
        Ok(Self::new(options))
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn open(&self) -> Result<PgConnection, ConnectError> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| ConnectError::Connect(e.to_string()))
    }

    async fn validate(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing connection");
        }
    }
}

/// Calls the recalculation procedure on a `PgConnection`
#[derive(Debug, Clone)]
pub struct PgProcedureInvoker {
    procedure: String,
    sql: String,
}

impl Default for PgProcedureInvoker {
    fn default() -> Self {
        Self::for_procedure(DEFAULT_PROCEDURE.to_string())
    }
}

impl PgProcedureInvoker {
    /// Invoker for the named procedure, optionally schema-qualified
    pub fn new(procedure: impl Into<String>) -> Result<Self, InvokeError> {
        let procedure = procedure.into();
        if !is_valid_procedure_name(&procedure) {
            return Err(InvokeError::Configuration(format!(
                "invalid procedure name: {procedure:?}"
            )));
        }
        Ok(Self::for_procedure(procedure))
    }

    fn for_procedure(procedure: String) -> Self {
        let sql = format!("CALL {procedure}($1, $2, $3::date, NULL, NULL)");
        Self { procedure, sql }
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Call statement; the task's fields are bound as `$1..$3`
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl ProcedureInvoker for PgProcedureInvoker {
    type Connection = PgConnection;

    #[instrument(skip_all, fields(task_id = task.task_id, procedure = %self.procedure))]
    async fn call(
        &self,
        conn: &mut PgConnection,
        task: &Task,
    ) -> Result<ProcedureOutput, InvokeError> {
        let row = sqlx::query(&self.sql)
            .bind(task.task_id)
            .bind(task.owner_id)
            .bind(task.effective_date.date())
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        let output = read_output(&row)?;
        debug!(status = output.status, "procedure returned");
        Ok(output)
    }
}

/// Read the status (column 0) and message (column 1) OUT values
fn read_output(row: &PgRow) -> Result<ProcedureOutput, InvokeError> {
    let status = read_status(row)?
        .ok_or_else(|| InvokeError::Output("status is NULL".into()))?;
    let message: Option<String> = row.try_get(1).map_err(map_sqlx_error)?;

    Ok(ProcedureOutput::new(status, message.unwrap_or_default()))
}

fn read_status(row: &PgRow) -> Result<Option<i32>, InvokeError> {
    let column = row.try_column(0).map_err(map_sqlx_error)?;
    match column.type_info().name() {
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(0)
            .map_err(map_sqlx_error)?
            .map(decimal_status)
            .transpose(),
        "INT2" => Ok(row
            .try_get::<Option<i16>, _>(0)
            .map_err(map_sqlx_error)?
            .map(i32::from)),
        "INT4" => row.try_get::<Option<i32>, _>(0).map_err(map_sqlx_error),
        "INT8" => row
            .try_get::<Option<i64>, _>(0)
            .map_err(map_sqlx_error)?
            .map(|status| {
                i32::try_from(status)
                    .map_err(|_| InvokeError::Output(format!("status {status} is out of range")))
            })
            .transpose(),
        other => Err(InvokeError::Output(format!(
            "status has unsupported type {other}"
        ))),
    }
}

/// Accept a numeric status such as `0`, `-3` or `12.000`
fn decimal_status(status: Decimal) -> Result<i32, InvokeError> {
    if !status.fract().is_zero() {
        return Err(InvokeError::Output(format!(
            "status {status} is not an integer"
        )));
    }
    status
        .to_i32()
        .ok_or_else(|| InvokeError::Output(format!("status {status} is out of range")))
}

fn map_sqlx_error(error: sqlx::Error) -> InvokeError {
    match error {
        sqlx::Error::RowNotFound => {
            InvokeError::Output("procedure returned no output row".into())
        }
        sqlx::Error::ColumnNotFound(column) => {
            InvokeError::Output(format!("missing output column {column}"))
        }
        sqlx::Error::ColumnIndexOutOfBounds { index, len } => InvokeError::Output(format!(
            "procedure returned {len} output columns, expected at least {}",
            index + 1
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            InvokeError::Output(error.to_string())
        }
        sqlx::Error::Encode(_) => InvokeError::Bind(error.to_string()),
        other => InvokeError::Database(other.to_string()),
    }
}
