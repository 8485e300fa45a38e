//! Configuration handling for db-helper.
//!
//! [`ExecutorOptions`] configures the library; [`Config`] is the command line
//! of the `db-helper` binary (CLI arguments and environment variables).

use crate::error::DbResult;
use crate::models::{CommandSpec, ConnectionConfig, Parameter, QueryParam};
use clap::{Args, Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CURSOR_BUFFER: usize = 64;

/// Per-executor limits. Immutable once the executor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Upper bound on opening one physical connection.
    pub connect_timeout: Duration,
    /// Upper bound on each driver round trip (execute, next row, commit...).
    pub command_timeout: Duration,
    /// Rows a cursor buffers ahead of its reader.
    pub cursor_buffer: usize,
}

impl ExecutorOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// A zero buffer is bumped to one; the channel needs capacity.
    pub fn with_cursor_buffer(mut self, rows: usize) -> Self {
        self.cursor_buffer = rows.max(1);
        self
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            cursor_buffer: DEFAULT_CURSOR_BUFFER,
        }
    }
}

/// Configuration for the db-helper binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-helper",
    about = "Run SQL text and stored procedures with named parameters",
    version,
    author
)]
pub struct Config {
    /// Database connection URL (postgres://, mysql:// or sqlite:)
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub database_url: String,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "DB_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Command timeout in seconds
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT_SECS, env = "DB_COMMAND_TIMEOUT")]
    pub command_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// One operation per invocation.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a statement and print the number of affected rows
    Execute(StatementArgs),
    /// Run a query and print each row as a JSON line
    Query(StatementArgs),
    /// Call a stored procedure
    Call {
        /// Procedure name, optionally schema-qualified
        procedure: String,
        /// Print the rows the procedure returns
        #[arg(long)]
        rows: bool,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Run a command producing several result sets and print them in order
    Multiple {
        /// SQL text, or a procedure name with --procedure
        command: String,
        #[arg(long)]
        procedure: bool,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Run one statement inside a transaction
    Transaction(StatementArgs),
}

#[derive(Debug, Clone, Args)]
pub struct StatementArgs {
    /// SQL text; parameters are referenced as @name or :name
    pub sql: String,
    #[command(flatten)]
    pub params: ParamArgs,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ParamArgs {
    /// Named parameter as name=value. Can be specified multiple times.
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<Parameter>,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validated connection settings for `database_url`.
    pub fn connection_config(&self) -> DbResult<ConnectionConfig> {
        ConnectionConfig::new(self.database_url.clone())
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_command_timeout(Duration::from_secs(self.command_timeout))
    }
}

impl Command {
    /// Command text as the executor expects it.
    pub fn command_spec(&self) -> CommandSpec {
        match self {
            Self::Execute(args) | Self::Query(args) | Self::Transaction(args) => {
                CommandSpec::text(args.sql.clone())
            }
            Self::Call { procedure, .. } => CommandSpec::procedure(procedure.clone()),
            Self::Multiple {
                command,
                procedure: true,
                ..
            } => CommandSpec::procedure(command.clone()),
            Self::Multiple { command, .. } => CommandSpec::text(command.clone()),
        }
    }

    pub fn params(&self) -> &[Parameter] {
        match self {
            Self::Execute(args) | Self::Query(args) | Self::Transaction(args) => {
                &args.params.params
            }
            Self::Call { params, .. } | Self::Multiple { params, .. } => &params.params,
        }
    }
}

/// Parse a `name=value` command line parameter.
pub fn parse_param(s: &str) -> Result<Parameter, String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected NAME=VALUE, got '{s}'"))?;
    let name = name.trim();
    if name.trim_start_matches(['@', ':']).is_empty() {
        return Err(format!("Missing parameter name in '{s}'"));
    }
    Ok(Parameter::new(name, parse_value(value)?))
}

/// Interpret a command line value.
///
/// `null`, `true`/`false`, integers and floats map to their SQL types; a
/// `json:` prefix binds the remainder as JSON; anything else is a string.
/// Wrap a value in single quotes to force a string (`'42'`).
pub fn parse_value(raw: &str) -> Result<QueryParam, String> {
    if let Some(json) = raw.strip_prefix("json:") {
        return serde_json::from_str::<JsonValue>(json)
            .map(QueryParam::Json)
            .map_err(|e| format!("Invalid JSON value: {e}"));
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Ok(QueryParam::String(raw[1..raw.len() - 1].to_string()));
    }
    if raw.eq_ignore_ascii_case("null") {
        return Ok(QueryParam::Null);
    }
    if let Ok(v) = raw.parse::<bool>() {
        return Ok(QueryParam::Bool(v));
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(QueryParam::Int(v));
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(QueryParam::Float(v)),
        _ => Ok(QueryParam::String(raw.to_string())),
    }
}
