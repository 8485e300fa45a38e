//! Shared test helpers: a scripted, counting connector.

#![allow(dead_code)]

use db_helper::db::{Connector, Fetched, PreparedCommand, Session};
use db_helper::{DatabaseType, Row};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a mock session answers to one command.
#[derive(Debug, Clone)]
pub enum Reply {
    Affected(u64),
    Rows(Vec<Row>),
    Sets(Vec<Vec<Row>>),
    /// A driver-level failure with this message.
    Fail(&'static str),
    /// Never completes.
    Hang,
    /// Rows, each delayed.
    Slow(Duration, Vec<Row>),
}

#[derive(Debug, Default)]
pub struct Stats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub commands: Mutex<Vec<PreparedCommand>>,
}

impl Stats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<PreparedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn last_command(&self) -> PreparedCommand {
        self.commands().pop().expect("no command ran")
    }
}

type Responder = dyn Fn(&PreparedCommand) -> Reply + Send + Sync;

pub struct MockConnector {
    db_type: DatabaseType,
    respond: Arc<Responder>,
    stats: Arc<Stats>,
    fail_connect: bool,
    fail_commit: bool,
}

impl MockConnector {
    pub fn new(
        db_type: DatabaseType,
        respond: impl Fn(&PreparedCommand) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            db_type,
            respond: Arc::new(respond),
            stats: Arc::new(Stats::default()),
            fail_connect: false,
            fail_commit: false,
        }
    }

    /// Answer every command with the same reply.
    pub fn always(db_type: DatabaseType, reply: Reply) -> Self {
        Self::new(db_type, move |_| reply.clone())
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }
}

impl Connector for MockConnector {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Session>, sqlx::Error>> {
        async move {
            if self.fail_connect {
                return Err(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            self.stats.opened.fetch_add(1, Ordering::SeqCst);
            let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_active.fetch_max(active, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                respond: Arc::clone(&self.respond),
                stats: Arc::clone(&self.stats),
                fail_commit: self.fail_commit,
            }) as Box<dyn Session>)
        }
        .boxed()
    }
}

struct MockSession {
    respond: Arc<Responder>,
    stats: Arc<Stats>,
    fail_commit: bool,
}

impl MockSession {
    fn reply(&self, command: &PreparedCommand) -> Reply {
        self.stats.commands.lock().unwrap().push(command.clone());
        (self.respond)(command)
    }
}

fn failure(message: &str) -> sqlx::Error {
    sqlx::Error::Protocol(message.to_string())
}

impl Session for MockSession {
    fn execute<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
        let reply = self.reply(command);
        async move {
            match reply {
                Reply::Affected(n) => Ok(n),
                Reply::Rows(_) | Reply::Sets(_) | Reply::Slow(..) => Ok(0),
                Reply::Fail(message) => Err(failure(message)),
                Reply::Hang => std::future::pending().await,
            }
        }
        .boxed()
    }

    fn fetch<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxStream<'a, Result<Row, sqlx::Error>> {
        match self.reply(command) {
            Reply::Affected(_) => stream::empty().boxed(),
            Reply::Rows(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Reply::Sets(sets) => stream::iter(sets.into_iter().flatten().map(Ok)).boxed(),
            Reply::Fail(message) => stream::once(async move { Err(failure(message)) }).boxed(),
            Reply::Hang => stream::pending().boxed(),
            Reply::Slow(delay, rows) => stream::iter(rows)
                .then(move |row| async move {
                    tokio::time::sleep(delay).await;
                    Ok(row)
                })
                .boxed(),
        }
    }

    fn fetch_many<'a>(
        &'a mut self,
        command: &'a PreparedCommand,
    ) -> BoxStream<'a, Result<Fetched, sqlx::Error>> {
        let done = |rows_affected| Fetched::Done { rows_affected };
        let items: Vec<Result<Fetched, sqlx::Error>> = match self.reply(command) {
            Reply::Affected(n) => vec![Ok(done(n))],
            Reply::Rows(rows) | Reply::Slow(_, rows) => rows
                .into_iter()
                .map(|r| Ok(Fetched::Row(r)))
                .chain([Ok(done(0))])
                .collect(),
            Reply::Sets(sets) => sets
                .into_iter()
                .flat_map(|set| {
                    set.into_iter()
                        .map(Fetched::Row)
                        .chain([done(0)])
                        .map(Ok)
                        .collect::<Vec<_>>()
                })
                .collect(),
            Reply::Fail(message) => vec![Err(failure(message))],
            Reply::Hang => return stream::pending().boxed(),
        };
        stream::iter(items).boxed()
    }

    fn begin(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        if self.fail_commit {
            return async { Err(failure("commit failed")) }.boxed();
        }
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), sqlx::Error>> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }
}

/// Build a row from a JSON object literal.
pub fn row(value: JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// Let Drop-scheduled closes run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
