//! Named parameter binding.
//!
//! Callers name their parameters (`@id`, `:id` or just `id`); sqlx binds
//! positionally. [`prepare`] turns a [`CommandSpec`] plus named [`Parameter`]s
//! into backend SQL with positional placeholders and an ordered binding list.
//! The `bind_*_param` functions then push those bindings onto sqlx queries.

use crate::error::{DbError, DbResult};
use crate::models::{CommandKind, CommandSpec, DatabaseType, ParamType, Parameter, QueryParam};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use std::collections::HashSet;

/// What the caller expects back from a stored procedure call.
///
/// PostgreSQL distinguishes procedures (`CALL`) from set-returning functions
/// (`SELECT * FROM`); other backends ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Execute,
    Rows,
}

/// One positional argument, remembering which named parameter it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub value: QueryParam,
    pub declared_type: Option<ParamType>,
}

impl Binding {
    fn from_param(param: &Parameter) -> Self {
        Self {
            name: param.bare_name().to_string(),
            value: param.value.clone(),
            declared_type: param.declared_type,
        }
    }
}

/// Backend-ready command: SQL with positional placeholders plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCommand {
    pub sql: String,
    pub bindings: Vec<Binding>,
    pub kind: CommandKind,
}

impl PreparedCommand {
    /// Value bound for the named parameter, if it was used.
    pub fn binding(&self, name: &str) -> Option<&QueryParam> {
        self.bindings
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name.trim_start_matches(['@', ':'])))
            .map(|b| &b.value)
    }
}

/// Prepare a command for `db_type`.
pub fn prepare(
    command: &CommandSpec,
    params: &[Parameter],
    db_type: DatabaseType,
    shape: ResultShape,
) -> DbResult<PreparedCommand> {
    check_unique_names(params)?;
    match command.kind {
        CommandKind::Text => Ok(rewrite_named(&command.text, params, db_type)),
        CommandKind::StoredProcedure => procedure_call(&command.text, params, db_type, shape),
    }
}

fn check_unique_names(params: &[Parameter]) -> DbResult<()> {
    let mut seen = HashSet::with_capacity(params.len());
    for param in params {
        let name = param.bare_name();
        if name.is_empty() {
            return Err(DbError::invalid_input("Parameter name cannot be empty"));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(DbError::invalid_input(format!(
                "Parameter '@{name}' was supplied more than once"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Command Text
// =============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrite `@name` / `:name` markers into positional placeholders.
///
/// Literals, quoted identifiers, comments, PostgreSQL dollar quotes, `::`
/// casts and `@@` variables are copied untouched. A marker with no matching
/// parameter is copied verbatim so the database reports it.
fn rewrite_named(sql: &str, params: &[Parameter], db_type: DatabaseType) -> PreparedCommand {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut bindings: Vec<Binding> = Vec::new();
    // PostgreSQL reuses `$n` for repeated names; `?` backends bind every occurrence.
    let mut numbered: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, db_type);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if next == Some('-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(chars.len(), |p| i + p);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if next == Some('*') => {
                let end = find_seq(&chars, i + 2, &['*', '/']).map_or(chars.len(), |p| p + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' if db_type == DatabaseType::PostgreSQL => {
                let end = skip_dollar_quoted(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '@' | ':' => {
                let prev = i.checked_sub(1).map(|p| chars[p]);
                let is_marker = next.is_some_and(is_ident_start)
                    && !prev.is_some_and(|p| is_ident_char(p) || p == c);
                if !is_marker {
                    // `@@var`, `::type`, `a:b` and friends
                    out.push(c);
                    if next == Some(c) {
                        out.push(c);
                        i += 1;
                    }
                    i += 1;
                    continue;
                }

                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| !is_ident_char(ch))
                    .map_or(chars.len(), |p| start + p);
                let name: String = chars[start..end].iter().collect();

                match params.iter().position(|p| p.matches(&name)) {
                    Some(idx) if db_type == DatabaseType::PostgreSQL => {
                        let slot = match numbered.iter().find(|(p, _)| *p == idx) {
                            Some((_, slot)) => *slot,
                            None => {
                                bindings.push(Binding::from_param(&params[idx]));
                                numbered.push((idx, bindings.len()));
                                bindings.len()
                            }
                        };
                        out.push_str(&format!("${slot}"));
                    }
                    Some(idx) => {
                        bindings.push(Binding::from_param(&params[idx]));
                        out.push('?');
                    }
                    None => out.extend(&chars[i..end]),
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    PreparedCommand {
        sql: out,
        bindings,
        kind: CommandKind::Text,
    }
}

/// Index one past the closing quote of the literal starting at `start`.
fn skip_quoted(chars: &[char], start: usize, db_type: DatabaseType) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && quote == '\'' && db_type == DatabaseType::MySQL {
            i += 2;
            continue;
        }
        if c == quote {
            // doubled quote is an escaped quote
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Index one past a `$tag$ ... $tag$` body, or past the lone `$` otherwise.
fn skip_dollar_quoted(chars: &[char], start: usize) -> usize {
    let tag_end = chars[start + 1..]
        .iter()
        .position(|&ch| !is_ident_char(ch))
        .map(|p| start + 1 + p);
    let Some(tag_end) = tag_end else {
        return chars.len();
    };
    let tag = &chars[start..=tag_end];
    let is_tag = chars[tag_end] == '$' && !chars.get(start + 1).is_some_and(|c| c.is_ascii_digit());
    if !is_tag {
        return start + 1;
    }
    find_seq(chars, tag_end + 1, tag).map_or(chars.len(), |p| p + tag.len())
}

fn find_seq(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

// =============================================================================
// Stored Procedures
// =============================================================================

fn procedure_call(
    name: &str,
    params: &[Parameter],
    db_type: DatabaseType,
    shape: ResultShape,
) -> DbResult<PreparedCommand> {
    validate_procedure_name(name)?;
    if !db_type.supports_procedures() {
        return Err(DbError::invalid_input(format!(
            "{db_type} does not support stored procedures (called '{name}')"
        )));
    }

    let bindings: Vec<Binding> = params.iter().map(Binding::from_param).collect();
    let sql = match db_type {
        DatabaseType::PostgreSQL => {
            let mut args = Vec::with_capacity(params.len());
            for (idx, param) in params.iter().enumerate() {
                let arg = param.bare_name();
                if !arg.chars().all(is_ident_char) || !arg.starts_with(is_ident_start) {
                    return Err(DbError::invalid_input(format!(
                        "Invalid procedure argument name: '{arg}'"
                    )));
                }
                args.push(format!("{arg} => ${}", idx + 1));
            }
            match shape {
                ResultShape::Execute => format!("CALL {name}({})", args.join(", ")),
                ResultShape::Rows => format!("SELECT * FROM {name}({})", args.join(", ")),
            }
        }
        // MySQL has no named arguments; order is the caller's.
        _ => {
            let marks = vec!["?"; params.len()];
            format!("CALL {name}({})", marks.join(", "))
        }
    };

    Ok(PreparedCommand {
        sql,
        bindings,
        kind: CommandKind::StoredProcedure,
    })
}

/// Accepts `name`, `schema.name`, and `"quoted"` / `` `quoted` `` segments.
fn validate_procedure_name(name: &str) -> DbResult<()> {
    let invalid = || DbError::invalid_input(format!("Invalid stored procedure name: '{name}'"));
    if name.is_empty() {
        return Err(invalid());
    }
    for segment in name.split('.') {
        let quoted = ['"', '`'].iter().any(|&q| {
            segment.len() >= 3
                && segment.starts_with(q)
                && segment.ends_with(q)
                && !segment[1..segment.len() - 1].contains(q)
        });
        let plain = segment.starts_with(is_ident_start)
            && segment.chars().all(|c| is_ident_char(c) || c == '$');
        if !quoted && !plain {
            return Err(invalid());
        }
    }
    Ok(())
}

// =============================================================================
// sqlx Binding
// =============================================================================

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    binding: &'q Binding,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match &binding.value {
        QueryParam::Null => match binding.declared_type {
            Some(ParamType::Int) => query.bind(None::<i64>),
            Some(ParamType::Float) => query.bind(None::<f64>),
            Some(ParamType::Bool) => query.bind(None::<bool>),
            _ => query.bind(None::<String>),
        },
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
///
/// PostgreSQL types every placeholder, so a NULL uses the declared type when
/// one was given.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    binding: &'q Binding,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match &binding.value {
        QueryParam::Null => match binding.declared_type {
            Some(ParamType::Bool) => query.bind(None::<bool>),
            Some(ParamType::Int) => query.bind(None::<i64>),
            Some(ParamType::Float) => query.bind(None::<f64>),
            Some(ParamType::Timestamp) => query.bind(None::<chrono::DateTime<chrono::Utc>>),
            Some(ParamType::Binary) => query.bind(None::<Vec<u8>>),
            Some(ParamType::Json) => query.bind(None::<Json<serde_json::Value>>),
            Some(ParamType::Text) | None => query.bind(None::<String>),
        },
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    binding: &'q Binding,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match &binding.value {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}
