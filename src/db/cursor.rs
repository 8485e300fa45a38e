//! Forward-only row cursor.
//!
//! A cursor owns its connection. A background task pulls rows from the
//! driver and forwards them over a bounded channel; it stops as soon as the
//! cursor is dropped and closes the connection on exhaustion, error or early
//! stop.

use crate::db::mapping::from_row;
use crate::db::params::PreparedCommand;
use crate::db::scope::ScopedConnection;
use crate::error::{DbError, DbResult};
use crate::models::Row;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Rows of one reader call, in server order.
///
/// Implements [`Stream`], so `TryStreamExt::try_collect` and friends work.
pub struct RowCursor {
    rx: mpsc::Receiver<DbResult<Row>>,
    operation: String,
}

impl RowCursor {
    /// Start streaming `command` on `conn`. Errors pass through `wrap` before
    /// they reach the reader.
    pub(crate) fn spawn<F>(
        conn: ScopedConnection,
        command: PreparedCommand,
        buffer: usize,
        wrap: F,
    ) -> Self
    where
        F: Fn(DbError) -> DbError + Send + Sync + 'static,
    {
        let operation = conn.operation().to_string();
        let (tx, rx) = mpsc::channel(buffer.max(1));

        tokio::spawn(async move {
            let mut conn = conn;
            pump(&mut conn, &command, &tx, &wrap).await;
            conn.release().await;
        });

        Self { rx, operation }
    }

    /// Next row, or `None` once the result set is exhausted.
    ///
    /// After an error the cursor is finished.
    pub async fn next_row(&mut self) -> Option<DbResult<Row>> {
        self.rx.recv().await
    }

    /// Next row decoded into `U`.
    pub async fn next_as<U: DeserializeOwned>(&mut self) -> Option<DbResult<U>> {
        let row = self.next_row().await?;
        Some(row.and_then(from_row))
    }

    /// Drain the remaining rows.
    pub async fn collect_rows(mut self) -> DbResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

async fn pump<F>(
    conn: &mut ScopedConnection,
    command: &PreparedCommand,
    tx: &mpsc::Sender<DbResult<Row>>,
    wrap: &F,
) where
    F: Fn(DbError) -> DbError,
{
    let mut rows = match conn.rows(command) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = tx.send(Err(wrap(e))).await;
            return;
        }
    };

    let mut sent = 0usize;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!(rows = sent, "Cursor dropped before the result set was exhausted");
                return;
            }
            next = rows.next_row() => next,
        };

        match next {
            Some(Ok(row)) => {
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
                sent += 1;
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(wrap(e))).await;
                return;
            }
            None => {
                debug!(rows = sent, "Cursor exhausted");
                return;
            }
        }
    }
}

impl Stream for RowCursor {
    type Item = DbResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
