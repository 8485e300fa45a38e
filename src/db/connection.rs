//! sqlx-backed driver.
//!
//! Opens one database-specific connection (MySqlConnection, PgConnection,
//! SqliteConnection) per call, never a pool: pooling policy belongs to
//! whatever sits in front of the database, not to this helper.

use crate::db::driver::{Connector, Fetched, Session};
use crate::db::params::{
    PreparedCommand, bind_mysql_param, bind_postgres_param, bind_sqlite_param,
};
use crate::db::types::DecodeRow;
use crate::models::{ConnectionConfig, DatabaseType, Row};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use tracing::debug;

/// Opens sqlx connections for one [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    config: ConnectionConfig,
}

impl SqlxConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl Connector for SqlxConnector {
    fn database_type(&self) -> DatabaseType {
        self.config.db_type
    }

    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Session>, sqlx::Error>> {
        Box::pin(async move {
            let url = self.config.connection_string.as_str();
            debug!(
                db_type = %self.config.db_type,
                url = %self.config.masked_connection_string(),
                "Opening database connection"
            );
            let conn = match self.config.db_type {
                DatabaseType::MySQL => {
                    let options = MySqlConnectOptions::from_str(url)?.charset("utf8mb4");
                    DbConnection::MySql(options.connect().await?)
                }
                DatabaseType::PostgreSQL => {
                    DbConnection::Postgres(PgConnectOptions::from_str(url)?.connect().await?)
                }
                DatabaseType::SQLite => {
                    DbConnection::SQLite(SqliteConnectOptions::from_str(url)?.connect().await?)
                }
            };
            Ok(Box::new(conn) as Box<dyn Session>)
        })
    }
}

/// Database-specific connection (avoids AnyConnection limitations).
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// Forward a call to the backend module matching the connection variant.
macro_rules! impl_db_dispatch {
    ($conn:expr, $func:ident($($arg:expr),*)) => {
        match $conn {
            DbConnection::MySql(c) => mysql::$func(c, $($arg),*),
            DbConnection::Postgres(c) => postgres::$func(c, $($arg),*),
            DbConnection::SQLite(c) => sqlite::$func(c, $($arg),*),
        }
    };
}

impl Session for DbConnection {
    fn execute<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
        impl_db_dispatch!(self, execute(command))
    }

    fn fetch<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxStream<'a, Result<Row, sqlx::Error>> {
        impl_db_dispatch!(self, fetch(command))
    }

    fn fetch_many<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxStream<'a, Result<Fetched, sqlx::Error>> {
        impl_db_dispatch!(self, fetch_many(command))
    }

    fn begin(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        impl_db_dispatch!(self, raw("BEGIN"))
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        impl_db_dispatch!(self, raw("COMMIT"))
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        impl_db_dispatch!(self, raw("ROLLBACK"))
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), sqlx::Error>> {
        match *self {
            DbConnection::MySql(c) => Box::pin(c.close()),
            DbConnection::Postgres(c) => Box::pin(c.close()),
            DbConnection::SQLite(c) => Box::pin(c.close()),
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module provides the same interface adapted to its database type. When
// nothing is bound the SQL goes over the simple/text protocol, since some
// statements (CALL without arguments, CREATE PROCEDURE, BEGIN) do not
// prepare everywhere.

macro_rules! impl_backend {
    ($module:ident, $conn:ty, $bind:path) => {
        mod $module {
            use super::*;
            use futures_util::{FutureExt, StreamExt, TryStreamExt, future};
            use sqlx::{Either, Executor};

            pub fn execute<'a>(
                conn: &'a mut $conn,
                command: &'a PreparedCommand,
            ) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
                async move {
                    let result = if command.bindings.is_empty() {
                        conn.execute(command.sql.as_str()).await?
                    } else {
                        let mut query = sqlx::query(&command.sql);
                        for binding in &command.bindings {
                            query = $bind(query, binding);
                        }
                        query.execute(&mut *conn).await?
                    };
                    Ok(result.rows_affected())
                }
                .boxed()
            }

            pub fn fetch<'a>(
                conn: &'a mut $conn,
                command: &'a PreparedCommand,
            ) -> BoxStream<'a, Result<Row, sqlx::Error>> {
                let rows = if command.bindings.is_empty() {
                    conn.fetch(command.sql.as_str())
                } else {
                    let mut query = sqlx::query(&command.sql);
                    for binding in &command.bindings {
                        query = $bind(query, binding);
                    }
                    query.fetch(conn)
                };
                rows.and_then(|row| future::ready(row.decode_row())).boxed()
            }

            pub fn fetch_many<'a>(
                conn: &'a mut $conn,
                command: &'a PreparedCommand,
            ) -> BoxStream<'a, Result<Fetched, sqlx::Error>> {
                let results = if command.bindings.is_empty() {
                    conn.fetch_many(command.sql.as_str())
                } else {
                    let mut query = sqlx::query(&command.sql);
                    for binding in &command.bindings {
                        query = $bind(query, binding);
                    }
                    conn.fetch_many(query)
                };
                results
                    .and_then(|item| {
                        future::ready(match item {
                            Either::Left(done) => Ok(Fetched::Done {
                                rows_affected: done.rows_affected(),
                            }),
                            Either::Right(row) => row.decode_row().map(Fetched::Row),
                        })
                    })
                    .boxed()
            }

            pub fn raw<'a>(
                conn: &'a mut $conn,
                sql: &'static str,
            ) -> BoxFuture<'a, Result<(), sqlx::Error>> {
                async move {
                    conn.execute(sql).await?;
                    Ok(())
                }
                .boxed()
            }
        }
    };
}

impl_backend!(mysql, MySqlConnection, bind_mysql_param);
impl_backend!(postgres, PgConnection, bind_postgres_param);
impl_backend!(sqlite, SqliteConnection, bind_sqlite_param);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_reports_database_type() {
        let config = ConnectionConfig::new("postgres://u:p@localhost/db").unwrap();
        let connector = SqlxConnector::new(config);
        assert_eq!(connector.database_type(), DatabaseType::PostgreSQL);
        assert!(!format!("{connector:?}").contains(":p@"));
    }

    #[tokio::test]
    async fn test_sqlite_connect_missing_file_fails() {
        let config = ConnectionConfig::new("sqlite:/nonexistent-dir/missing.db").unwrap();
        let connector = SqlxConnector::new(config);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_session_roundtrip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().display());
        let connector = SqlxConnector::new(ConnectionConfig::new(url).unwrap());
        let mut session = connector.connect().await.unwrap();

        let create = PreparedCommand {
            sql: "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)".to_string(),
            bindings: vec![],
            kind: crate::models::CommandKind::Text,
        };
        session.execute(&create).await.unwrap();

        let insert = crate::db::params::prepare(
            &crate::models::CommandSpec::text("INSERT INTO t (id, name) VALUES (@id, @name)"),
            &[
                crate::models::Parameter::new("id", 1),
                crate::models::Parameter::new("name", "Ann"),
            ],
            DatabaseType::SQLite,
            crate::db::params::ResultShape::Execute,
        )
        .unwrap();
        assert_eq!(session.execute(&insert).await.unwrap(), 1);

        let select = PreparedCommand {
            sql: "SELECT id, name FROM t".to_string(),
            bindings: vec![],
            kind: crate::models::CommandKind::Text,
        };
        use futures_util::TryStreamExt;
        let rows: Vec<Row> = session.fetch(&select).try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!(1));
        assert_eq!(rows[0]["name"], serde_json::json!("Ann"));

        session.close().await.unwrap();
    }
}
