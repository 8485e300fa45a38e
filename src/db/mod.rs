//! Database access layer.
//!
//! - `executor`: the public operations, one connection per call
//! - `scope`: connection acquisition, release and failure classification
//! - `driver` / `connection`: the driver seam and its sqlx implementation
//! - `params`: named parameters to positional placeholders
//! - `types`: row decoding into JSON values
//! - `mapping` / `table`: rows to caller types, caller records to tables
//! - `cursor`: forward-only rows on a dedicated connection

pub mod connection;
pub mod cursor;
pub mod driver;
pub mod executor;
pub mod mapping;
pub mod params;
pub mod scope;
pub mod table;
pub mod types;

pub use connection::{DbConnection, SqlxConnector};
pub use cursor::RowCursor;
pub use driver::{Connector, Fetched, Session};
pub use executor::QueryExecutor;
pub use mapping::{ResultSets, from_row, from_rows};
pub use params::{PreparedCommand, ResultShape, prepare};
pub use scope::{ConnectionScope, ScopedConnection, ScopedRows, TransactionScope};
pub use table::{ColumnType, DEFAULT_TABLE_PARAMETER, DataTable, TableColumn};
