//! Command and parameter models.
//!
//! This module defines what a caller hands to the executor for one call: the
//! command (text or stored procedure) and its named parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// One decoded result row: column name to value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// All rows produced by one statement.
pub type ResultSet = Vec<Row>;

/// A parameter value for parameterized commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value, bound as the backend's JSON type
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Timestamp(_) => "timestamp",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "'{}'", v.to_rfc3339()),
            Self::String(v) => write!(f, "'{v}'"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_param {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )+
    };
}

impl_from_param! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    f64 => Float,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => Timestamp,
    JsonValue => Json,
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Declared SQL type of a parameter, when the caller wants to pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    Binary,
    Json,
}

/// A named parameter for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: QueryParam,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<ParamType>,
}

impl Parameter {
    /// Create a parameter; a leading `@` or `:` on the name is accepted.
    pub fn new(name: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            declared_type: None,
        }
    }

    /// Pin the declared SQL type.
    pub fn with_type(mut self, declared_type: ParamType) -> Self {
        self.declared_type = Some(declared_type);
        self
    }

    /// Name without any `@` / `:` prefix.
    pub fn bare_name(&self) -> &str {
        self.name.trim_start_matches(['@', ':'])
    }

    /// Check whether this parameter answers to `name` (case-insensitive, prefix ignored).
    pub fn matches(&self, name: &str) -> bool {
        self.bare_name()
            .eq_ignore_ascii_case(name.trim_start_matches(['@', ':']))
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}={}", self.bare_name(), self.value)
    }
}

/// Render a parameter list for error messages, e.g. `[@id=7, @name='Ann']`.
pub fn render_parameters(params: &[Parameter]) -> String {
    let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

/// How the command text should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// Command text or stored procedure name for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub text: String,
    #[serde(default)]
    pub kind: CommandKind,
}

impl CommandSpec {
    /// A literal SQL statement.
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            text: sql.into(),
            kind: CommandKind::Text,
        }
    }

    /// A stored procedure invoked by name.
    pub fn procedure(name: impl Into<String>) -> Self {
        Self {
            text: name.into(),
            kind: CommandKind::StoredProcedure,
        }
    }

    pub fn is_procedure(&self) -> bool {
        self.kind == CommandKind::StoredProcedure
    }
}

impl From<&str> for CommandSpec {
    fn from(sql: &str) -> Self {
        Self::text(sql)
    }
}

impl From<String> for CommandSpec {
    fn from(sql: String) -> Self {
        Self::text(sql)
    }
}
