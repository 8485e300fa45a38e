//! Driver boundary.
//!
//! The executor depends only on this capability set: open a connection, run
//! a prepared command, iterate rows or a sequence of result sets, and drive a
//! single transaction. [`crate::db::connection::SqlxConnector`] implements it
//! over sqlx; tests plug in their own.
//!
//! Both traits are object safe so the executor holds an `Arc<dyn Connector>`
//! and stays non-generic.

use crate::db::params::PreparedCommand;
use crate::models::{DatabaseType, Row};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

/// One item of a multi-result fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Row(Row),
    /// End of one statement's results.
    Done { rows_affected: u64 },
}

/// Opens physical connections. Shared by every call on an executor.
pub trait Connector: Send + Sync + 'static {
    /// Backend the connections speak; decides placeholder and call syntax.
    fn database_type(&self) -> DatabaseType;

    /// Open one new physical connection.
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Session>, sqlx::Error>>;
}

/// One open connection, used by exactly one call.
pub trait Session: Send + 'static {
    /// Run a command and report affected rows.
    fn execute<'a>(&'a mut self, command: &'a PreparedCommand)
    -> BoxFuture<'a, Result<u64, sqlx::Error>>;

    /// Stream the rows the command returns, forward only.
    fn fetch<'a>(&'a mut self, command: &'a PreparedCommand)
    -> BoxStream<'a, Result<Row, sqlx::Error>>;

    /// Stream every result the command produces, in order, with a
    /// [`Fetched::Done`] after each statement.
    fn fetch_many<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxStream<'a, Result<Fetched, sqlx::Error>>;

    fn begin(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    fn commit(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    fn rollback(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    /// Close the connection gracefully.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), sqlx::Error>>;
}
