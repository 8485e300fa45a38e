//! Query execution engine.
//!
//! [`QueryExecutor`] runs SQL text and stored procedures with named
//! parameters. It holds no connection: every operation opens its own through
//! [`ConnectionScope`] and releases it before returning (cursors release
//! theirs when they finish). One executor can be shared across tasks via
//! `Arc`.
//!
//! Every failure comes back as [`DbError::Operation`], naming the operation
//! and the parameters it ran with, with the classified cause as its source.

use crate::config::ExecutorOptions;
use crate::db::connection::SqlxConnector;
use crate::db::cursor::RowCursor;
use crate::db::driver::{Connector, Fetched};
use crate::db::mapping::{ResultSets, from_rows};
use crate::db::params::{PreparedCommand, ResultShape, prepare};
use crate::db::scope::ConnectionScope;
use crate::db::table::{DEFAULT_TABLE_PARAMETER, DataTable};
use crate::error::{DbError, DbResult};
use crate::models::{
    CommandKind, CommandSpec, ConnectionConfig, DatabaseType, Parameter, ResultSet,
    render_parameters,
};
use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes commands against one database, one connection per call.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    scope: ConnectionScope,
}

impl QueryExecutor {
    /// Create an executor with default options.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_options(config, ExecutorOptions::default())
    }

    pub fn with_options(config: ConnectionConfig, options: ExecutorOptions) -> Self {
        Self::with_connector(Arc::new(SqlxConnector::new(config)), options)
    }

    /// Parse a connection URL and create an executor with default options.
    pub fn from_url(url: &str) -> DbResult<Self> {
        Ok(Self::new(ConnectionConfig::new(url)?))
    }

    /// Create an executor over any [`Connector`].
    pub fn with_connector(connector: Arc<dyn Connector>, options: ExecutorOptions) -> Self {
        Self {
            scope: ConnectionScope::new(connector, options, type_name()),
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.scope.database_type()
    }

    pub fn options(&self) -> &ExecutorOptions {
        self.scope.options()
    }

    /// Run a parameterless statement and return the affected row count.
    pub async fn execute_non_query(&self, sql: &str) -> DbResult<u64> {
        const OP: &str = "execute_non_query";
        let run = async {
            let command = self.prepare(&CommandSpec::text(sql), &[], ResultShape::Execute)?;
            self.scope
                .with_connection(OP, move |conn| {
                    async move { conn.execute(&command).await }.boxed()
                })
                .await
        };
        wrapped(OP, || render_parameters(&[]), run).await
    }

    /// Call a stored procedure for its side effects.
    pub async fn execute_non_query_procedure(
        &self,
        procedure: &str,
        params: &[Parameter],
    ) -> DbResult<()> {
        const OP: &str = "execute_non_query_procedure";
        let run = async {
            let command =
                self.prepare(&CommandSpec::procedure(procedure), params, ResultShape::Execute)?;
            self.scope
                .with_connection(OP, move |conn| {
                    async move { conn.execute(&command).await.map(|_| ()) }.boxed()
                })
                .await
        };
        wrapped(OP, || render_parameters(params), run).await
    }

    /// Open a forward-only cursor over the rows of a query.
    ///
    /// The connection stays open until the cursor is exhausted, fails or is
    /// dropped.
    pub async fn execute_reader(&self, sql: &str, params: &[Parameter]) -> DbResult<RowCursor> {
        self.reader("execute_reader", CommandSpec::text(sql), params)
            .await
    }

    /// Open a forward-only cursor over the rows a stored procedure returns.
    pub async fn execute_reader_procedure(
        &self,
        procedure: &str,
        params: &[Parameter],
    ) -> DbResult<RowCursor> {
        self.reader(
            "execute_reader_procedure",
            CommandSpec::procedure(procedure),
            params,
        )
        .await
    }

    async fn reader(
        &self,
        operation: &'static str,
        command: CommandSpec,
        params: &[Parameter],
    ) -> DbResult<RowCursor> {
        let run = async {
            let prepared = self.prepare(&command, params, ResultShape::Rows)?;
            let conn = self.scope.acquire(operation).await?;
            let parameters = render_parameters(params);
            let wrap = move |err: DbError| wrap_error(operation, parameters.clone(), err);
            Ok(RowCursor::spawn(
                conn,
                prepared,
                self.options().cursor_buffer,
                wrap,
            ))
        };
        wrapped(operation, || render_parameters(params), run).await
    }

    /// Run a parameterized statement and return the affected row count.
    pub async fn execute_command(&self, sql: &str, params: &[Parameter]) -> DbResult<u64> {
        const OP: &str = "execute_command";
        let run = async {
            let command = self.prepare(&CommandSpec::text(sql), params, ResultShape::Execute)?;
            self.scope
                .with_connection(OP, move |conn| {
                    async move { conn.execute(&command).await }.boxed()
                })
                .await
        };
        wrapped(OP, || render_parameters(params), run).await
    }

    /// Run a query or procedure and decode each row into `U`.
    ///
    /// Columns match `U`'s fields by name, case-insensitively.
    pub async fn execute_query<U: DeserializeOwned>(
        &self,
        command: impl Into<CommandSpec>,
        params: &[Parameter],
    ) -> DbResult<Vec<U>> {
        const OP: &str = "execute_query";
        let command = command.into();
        let run = async {
            let prepared = self.prepare(&command, params, ResultShape::Rows)?;
            let rows = self.fetch_all(OP, prepared).await?;
            from_rows(rows)
        };
        wrapped(OP, || render_parameters(params), run).await
    }

    /// Run a command that produces several result sets and return them in order.
    ///
    /// A statement that reports affected rows and returns none (an `UPDATE` in
    /// a batch) is not a result set. A query with no rows still is, and so is a
    /// statement that neither returns rows nor affects any.
    pub async fn execute_query_multiple(
        &self,
        command: impl Into<CommandSpec>,
        params: &[Parameter],
    ) -> DbResult<ResultSets> {
        const OP: &str = "execute_query_multiple";
        let command = command.into();
        let run = async {
            let prepared = self.prepare(&command, params, ResultShape::Rows)?;
            // MySQL terminates every CALL with a status-only result.
            let trailing_status = self.database_type() == DatabaseType::MySQL
                && prepared.kind == CommandKind::StoredProcedure;
            let items = self
                .scope
                .with_connection(OP, move |conn| {
                    async move { conn.fetch_results(&prepared).await }.boxed()
                })
                .await?;
            let sets = split_result_sets(items, trailing_status);
            debug!(operation = OP, sets = sets.len(), "Result sets received");
            Ok(ResultSets::new(sets))
        };
        wrapped(OP, || render_parameters(params), run).await
    }

    /// Run one statement inside a transaction.
    ///
    /// Commits on success. If the statement fails the transaction is rolled
    /// back before the error is returned.
    pub async fn execute_transaction(
        &self,
        command: impl Into<CommandSpec>,
        params: &[Parameter],
    ) -> DbResult<()> {
        const OP: &str = "execute_transaction";
        let command = command.into();
        let run = async {
            let prepared = self.prepare(&command, params, ResultShape::Execute)?;
            self.scope
                .with_connection(OP, move |conn| {
                    async move {
                        let mut tx = conn.begin().await?;
                        match tx.execute(&prepared).await {
                            Ok(_) => tx.commit().await,
                            Err(err) => {
                                if let Err(rollback_err) = tx.rollback().await {
                                    warn!(
                                        operation = OP,
                                        error = %rollback_err,
                                        "Rollback failed after statement error"
                                    );
                                }
                                Err(err)
                            }
                        }
                    }
                    .boxed()
                })
                .await
        };
        wrapped(OP, || render_parameters(params), run).await
    }

    /// Call a procedure with `items` as a table-valued parameter named `rows`
    /// and decode the rows it returns.
    pub async fn execute_table_valued_procedure<U>(
        &self,
        procedure: &str,
        items: &[U],
    ) -> DbResult<Vec<U>>
    where
        U: Serialize + DeserializeOwned,
    {
        self.execute_table_valued_procedure_named(procedure, DEFAULT_TABLE_PARAMETER, items)
            .await
    }

    /// Like [`Self::execute_table_valued_procedure`] with a custom parameter name.
    pub async fn execute_table_valued_procedure_named<U>(
        &self,
        procedure: &str,
        parameter: &str,
        items: &[U],
    ) -> DbResult<Vec<U>>
    where
        U: Serialize + DeserializeOwned,
    {
        const OP: &str = "execute_table_valued_procedure";
        let run = async {
            let table = DataTable::from_items(items)?;
            debug!(
                operation = OP,
                columns = table.columns().len(),
                rows = table.len(),
                "Table-valued parameter built"
            );
            let params = [table.to_parameter(parameter)];
            let prepared =
                self.prepare(&CommandSpec::procedure(procedure), &params, ResultShape::Rows)?;
            let rows = self.fetch_all(OP, prepared).await?;
            from_rows(rows)
        };
        wrapped(
            OP,
            || format!("[@{}=<{} rows>]", parameter.trim_start_matches(['@', ':']), items.len()),
            run,
        )
        .await
    }

    fn prepare(
        &self,
        command: &CommandSpec,
        params: &[Parameter],
        shape: ResultShape,
    ) -> DbResult<PreparedCommand> {
        prepare(command, params, self.database_type(), shape)
    }

    async fn fetch_all(
        &self,
        operation: &'static str,
        prepared: PreparedCommand,
    ) -> DbResult<ResultSet> {
        self.scope
            .with_connection(operation, move |conn| {
                async move { conn.fetch_all(&prepared).await }.boxed()
            })
            .await
    }
}

fn type_name() -> &'static str {
    std::any::type_name::<QueryExecutor>()
}

/// Await `run`, wrapping any failure in the operation envelope.
async fn wrapped<T>(
    operation: &'static str,
    parameters: impl FnOnce() -> String,
    run: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match run.await {
        Ok(value) => Ok(value),
        Err(err) => Err(wrap_error(operation, parameters(), err)),
    }
}

fn wrap_error(operation: &'static str, parameters: String, err: DbError) -> DbError {
    warn!(
        operation,
        parameters = %parameters,
        error = %err,
        "Database operation failed"
    );
    DbError::operation(type_name(), operation, parameters, err)
}

/// Split a sequential fetch into one result set per statement.
fn split_result_sets(items: Vec<Fetched>, trailing_status: bool) -> Vec<ResultSet> {
    let mut sets = Vec::new();
    let mut current = Vec::new();
    for item in items {
        match item {
            Fetched::Row(row) => current.push(row),
            Fetched::Done { rows_affected } => {
                let rows = std::mem::take(&mut current);
                if rows.is_empty() && rows_affected > 0 {
                    continue;
                }
                sets.push(rows);
            }
        }
    }
    if !current.is_empty() {
        sets.push(current);
    }
    if trailing_status && sets.last().is_some_and(Vec::is_empty) {
        sets.pop();
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;
    use serde_json::json;

    fn row(n: i64) -> Row {
        let mut row = Row::new();
        row.insert("n".into(), json!(n));
        row
    }

    #[test]
    fn test_split_one_set_per_statement() {
        let items = vec![
            Fetched::Row(row(1)),
            Fetched::Row(row(2)),
            Fetched::Done { rows_affected: 0 },
            Fetched::Done { rows_affected: 0 },
            Fetched::Row(row(3)),
            Fetched::Done { rows_affected: 0 },
        ];
        let sets = split_result_sets(items, false);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].len(), 2);
        assert!(sets[1].is_empty());
        assert_eq!(sets[2], vec![row(3)]);
    }

    #[test]
    fn test_split_skips_statements_that_only_affect_rows() {
        let items = vec![
            Fetched::Done { rows_affected: 4 },
            Fetched::Row(row(1)),
            Fetched::Done { rows_affected: 0 },
        ];
        assert_eq!(split_result_sets(items, false), vec![vec![row(1)]]);
    }

    #[test]
    fn test_split_drops_trailing_status() {
        let items = vec![
            Fetched::Row(row(1)),
            Fetched::Done { rows_affected: 0 },
            Fetched::Done { rows_affected: 0 },
        ];
        assert_eq!(split_result_sets(items.clone(), true).len(), 1);
        assert_eq!(split_result_sets(items, false).len(), 2);
    }

    #[test]
    fn test_split_rows_without_done() {
        let sets = split_result_sets(vec![Fetched::Row(row(1))], false);
        assert_eq!(sets, vec![vec![row(1)]]);
        assert!(split_result_sets(vec![], true).is_empty());
    }

    #[test]
    fn test_executor_type_name() {
        assert!(type_name().ends_with("QueryExecutor"));
        let executor = QueryExecutor::from_url("sqlite::memory:").unwrap();
        assert_eq!(executor.database_type(), DatabaseType::SQLite);
        assert_eq!(executor.options(), &ExecutorOptions::default());
    }

    #[test]
    fn test_from_url_rejects_unknown_scheme() {
        assert!(QueryExecutor::from_url("oracle://host/db").is_err());
    }
}
