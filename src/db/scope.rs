//! Call-scoped connections.
//!
//! Every executor operation runs inside [`ConnectionScope::with_connection`]:
//! open one physical connection, hand it to the operation body, close it on
//! every exit path. Driver failures are classified here, once, into
//! [`DbError::Timeout`] or [`DbError::Driver`].
//!
//! [`ScopedConnection`] is the guard. Release it explicitly with
//! [`ScopedConnection::release`]; if the owning future is dropped first the
//! guard's `Drop` schedules the close on the tokio runtime.

use crate::config::ExecutorOptions;
use crate::db::driver::{Connector, Fetched, Session};
use crate::db::params::PreparedCommand;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Opens one connection per call through a shared [`Connector`].
#[derive(Clone)]
pub struct ConnectionScope {
    connector: Arc<dyn Connector>,
    options: ExecutorOptions,
    owner: &'static str,
}

impl ConnectionScope {
    /// `owner` prefixes operation names in errors and logs, e.g. the executor's type name.
    pub fn new(connector: Arc<dyn Connector>, options: ExecutorOptions, owner: &'static str) -> Self {
        Self {
            connector,
            options,
            owner,
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.connector.database_type()
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Fully qualified operation name: `<owner>::<operation>`.
    pub fn qualified(&self, operation: &str) -> String {
        format!("{}::{}", self.owner, operation)
    }

    /// Open a connection and return the guard.
    ///
    /// Callers own the release; prefer [`Self::with_connection`] unless the
    /// connection has to outlive the current call frame.
    pub async fn acquire(&self, operation: &str) -> DbResult<ScopedConnection> {
        let operation = self.qualified(operation);
        let limit = self.options.connect_timeout;
        let session = bounded(&operation, limit, self.connector.connect()).await?;
        debug!(operation = %operation, "Connection opened");
        Ok(ScopedConnection {
            session: Some(session),
            operation,
            command_timeout: self.options.command_timeout,
        })
    }

    /// Run `body` with a freshly opened connection and close it afterwards.
    ///
    /// The body borrows the connection only, so it moves in whatever else it
    /// needs (`|conn| async move { conn.execute(&command).await }.boxed()`).
    ///
    /// The body's own errors propagate unchanged. A failure to close the
    /// connection is logged and does not replace the body's result.
    pub async fn with_connection<T, F>(&self, operation: &str, body: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedConnection) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut conn = self.acquire(operation).await?;
        let result = body(&mut conn).await;
        conn.release().await;
        result
    }
}

impl fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("db_type", &self.database_type())
            .field("options", &self.options)
            .field("owner", &self.owner)
            .finish()
    }
}

/// One open connection, owned by exactly one call.
pub struct ScopedConnection {
    session: Option<Box<dyn Session>>,
    operation: String,
    command_timeout: Duration,
}

impl ScopedConnection {
    /// Qualified name of the operation that opened this connection.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    fn parts(&mut self) -> DbResult<(&mut dyn Session, &str, Duration)> {
        match self.session.as_deref_mut() {
            Some(session) => Ok((session, &self.operation, self.command_timeout)),
            None => Err(DbError::internal(format!(
                "{} used a connection after releasing it",
                self.operation
            ))),
        }
    }

    /// Run a command and return the affected row count.
    pub async fn execute(&mut self, command: &PreparedCommand) -> DbResult<u64> {
        let (session, operation, limit) = self.parts()?;
        debug!(
            operation = %operation,
            sql = %command.sql,
            bindings = command.bindings.len(),
            "Executing command"
        );
        bounded(operation, limit, session.execute(command)).await
    }

    /// Rows the command returns, pulled one at a time.
    pub fn rows<'a>(&'a mut self, command: &'a PreparedCommand) -> DbResult<ScopedRows<'a>> {
        let (session, operation, limit) = self.parts()?;
        debug!(operation = %operation, sql = %command.sql, "Fetching rows");
        Ok(ScopedRows {
            inner: session.fetch(command),
            operation,
            limit,
        })
    }

    /// Collect every row the command returns.
    pub async fn fetch_all(&mut self, command: &PreparedCommand) -> DbResult<Vec<Row>> {
        let mut rows = self.rows(command)?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next_row().await {
            collected.push(row?);
        }
        Ok(collected)
    }

    /// Collect every result the command produces, in driver order.
    pub async fn fetch_results(&mut self, command: &PreparedCommand) -> DbResult<Vec<Fetched>> {
        let (session, operation, limit) = self.parts()?;
        debug!(operation = %operation, sql = %command.sql, "Fetching result sets");
        let mut stream = session.fetch_many(command);
        let mut items = Vec::new();
        while let Some(item) = next_bounded(&mut stream, operation, limit).await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Start a transaction on this connection.
    pub async fn begin(&mut self) -> DbResult<TransactionScope<'_>> {
        {
            let (session, operation, limit) = self.parts()?;
            bounded(operation, limit, session.begin()).await?;
            debug!(operation = %operation, "Transaction started");
        }
        Ok(TransactionScope {
            conn: self,
            finished: false,
        })
    }

    /// Close the connection gracefully.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!(operation = %self.operation, "Connection closed"),
                Err(e) => warn!(
                    operation = %self.operation,
                    error = %e,
                    "Connection did not close cleanly"
                ),
            }
        }
    }
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("operation", &self.operation)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let operation = std::mem::take(&mut self.operation);

        // The owning future was cancelled or panicked; close asynchronously.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let closed = session.close().await.is_ok();
                    warn!(
                        operation = %operation,
                        closed,
                        "Connection released via Drop - consider using explicit release()"
                    );
                });
            }
            Err(_) => {
                drop(session);
                warn!(
                    operation = %operation,
                    "Connection dropped outside a tokio runtime without a close handshake"
                );
            }
        }
    }
}

/// Forward-only rows with the command timeout applied to each fetch.
pub struct ScopedRows<'a> {
    inner: BoxStream<'a, Result<Row, sqlx::Error>>,
    operation: &'a str,
    limit: Duration,
}

impl ScopedRows<'_> {
    /// Next row, or `None` once the result set is exhausted.
    pub async fn next_row(&mut self) -> Option<DbResult<Row>> {
        next_bounded(&mut self.inner, self.operation, self.limit).await
    }
}

/// One commit-or-rollback unit on a scoped connection. Never reused.
///
/// Dropping it unfinished leaves the transaction open until the connection
/// closes, which discards it.
pub struct TransactionScope<'c> {
    conn: &'c mut ScopedConnection,
    finished: bool,
}

impl TransactionScope<'_> {
    pub async fn execute(&mut self, command: &PreparedCommand) -> DbResult<u64> {
        self.conn.execute(command).await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        let (session, operation, limit) = self.conn.parts()?;
        bounded(operation, limit, session.commit()).await?;
        debug!(operation = %operation, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        let (session, operation, limit) = self.conn.parts()?;
        bounded(operation, limit, session.rollback()).await?;
        debug!(operation = %operation, "Transaction rolled back");
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                operation = %self.conn.operation,
                "Transaction dropped without commit or rollback"
            );
        }
    }
}

/// Await a driver call under `limit`, classifying failures.
async fn bounded<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, sqlx::Error>>,
) -> DbResult<T> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DbError::from_driver(operation, e)),
        Err(_) => Err(DbError::timeout(operation, limit)),
    }
}

async fn next_bounded<T>(
    stream: &mut BoxStream<'_, Result<T, sqlx::Error>>,
    operation: &str,
    limit: Duration,
) -> Option<DbResult<T>> {
    match timeout(limit, stream.next()).await {
        Ok(Some(Ok(item))) => Some(Ok(item)),
        Ok(Some(Err(e))) => Some(Err(DbError::from_driver(operation, e))),
        Ok(None) => None,
        Err(_) => Some(Err(DbError::timeout(operation, limit))),
    }
}
