//! db-helper library.
//!
//! Runs SQL text and stored procedures against PostgreSQL, MySQL and SQLite
//! with named parameters, opening one connection per call and closing it on
//! every exit path.
//!
//! ```no_run
//! use db_helper::{Parameter, QueryExecutor};
//!
//! # async fn run() -> db_helper::DbResult<()> {
//! let executor = QueryExecutor::from_url("sqlite:app.db")?;
//! let updated = executor
//!     .execute_command(
//!         "UPDATE t SET x = @v WHERE id = @id",
//!         &[Parameter::new("v", 5), Parameter::new("id", 1)],
//!     )
//!     .await?;
//! assert_eq!(updated, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, ExecutorOptions};
pub use db::{QueryExecutor, ResultSets, RowCursor};
pub use error::{DbError, DbResult};
pub use models::{CommandSpec, ConnectionConfig, DatabaseType, Parameter, QueryParam, Row};
