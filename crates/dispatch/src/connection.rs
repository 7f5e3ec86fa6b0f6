//! Connection collaborator interface
//!
//! The engine never talks to a database client directly. A [`Connector`]
//! opens sessions, checks whether they are still usable, and closes them.
//! The [`ConnectionPool`](crate::pool::ConnectionPool) is the only caller.

use async_trait::async_trait;

/// Error opening a connection
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// Connection settings could not be parsed
    #[error("invalid connection configuration: {0}")]
    Configuration(String),

    /// The data store refused or dropped the connection attempt
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Opens, validates, and closes sessions against an external data store
///
/// Implementations must be shareable across workers. Each connection they
/// hand out is used by exactly one worker at a time.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session handle
    type Connection: Send + 'static;

    /// Open a new session
    async fn open(&self) -> Result<Self::Connection, ConnectError>;

    /// Check that an idle session is still usable
    async fn validate(&self, conn: &mut Self::Connection) -> bool;

    /// Close a session, ignoring errors
    async fn close(&self, conn: Self::Connection);
}
