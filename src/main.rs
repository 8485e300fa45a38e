//! db-helper - Main entry point.
//!
//! Runs one command against `--database-url` and prints the outcome: rows as
//! JSON lines, affected row counts as plain text.

use clap::Parser;
use db_helper::config::{Command, Config};
use db_helper::{DbResult, QueryExecutor, Row};
use futures_util::TryStreamExt;
use std::io::{self, Write};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout carries only results.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let connection = config.connection_config()?;
    info!(
        db_type = %connection.db_type,
        url = %connection.masked_connection_string(),
        "Starting db-helper v{}",
        env!("CARGO_PKG_VERSION")
    );

    let executor = QueryExecutor::with_options(connection, config.executor_options());
    if let Err(e) = run(&executor, &config.command).await {
        error!(error = %e, "Command failed");
        return Err(e.into());
    }
    Ok(())
}

async fn run(executor: &QueryExecutor, command: &Command) -> DbResult<()> {
    let params = command.params();
    match command {
        Command::Execute(args) => {
            let affected = if params.is_empty() {
                executor.execute_non_query(&args.sql).await?
            } else {
                executor.execute_command(&args.sql, params).await?
            };
            println!("{affected}");
        }
        Command::Query(args) => {
            let cursor = executor.execute_reader(&args.sql, params).await?;
            let rows: Vec<Row> = cursor.try_collect().await?;
            print_rows(&rows)?;
        }
        Command::Call {
            procedure, rows, ..
        } => {
            if *rows {
                let cursor = executor.execute_reader_procedure(procedure, params).await?;
                let rows: Vec<Row> = cursor.try_collect().await?;
                print_rows(&rows)?;
            } else {
                executor.execute_non_query_procedure(procedure, params).await?;
                println!("ok");
            }
        }
        Command::Multiple { .. } => {
            let sets = executor
                .execute_query_multiple(command.command_spec(), params)
                .await?;
            for (index, set) in sets.into_iter().enumerate() {
                println!("-- result set {index} ({} rows)", set.len());
                print_rows(&set)?;
            }
        }
        Command::Transaction(args) => {
            executor.execute_transaction(args.sql.as_str(), params).await?;
            println!("committed");
        }
    }
    Ok(())
}

fn print_rows(rows: &[Row]) -> DbResult<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        let line = serde_json::to_string(row)
            .map_err(|e| db_helper::DbError::internal(format!("Failed to encode row: {e}")))?;
        writeln!(out, "{line}")
            .map_err(|e| db_helper::DbError::internal(format!("Failed to write output: {e}")))?;
    }
    Ok(())
}
