//! Connection-related data models.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Whether the backend can invoke stored procedures at all.
    pub fn supports_procedures(&self) -> bool {
        !matches!(self, Self::SQLite)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Connection string for one executor. Immutable once the executor is built.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub db_type: DatabaseType,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
}

impl ConnectionConfig {
    /// Validate a connection URL and detect its database type.
    pub fn new(connection_string: impl Into<String>) -> DbResult<Self> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(DbError::configuration("Connection string cannot be empty"));
        }

        let db_type = DatabaseType::from_connection_string(&connection_string).ok_or_else(|| {
            DbError::configuration(format!(
                "Unknown database type in connection string: {}",
                mask(&connection_string)
            ))
        })?;

        if db_type != DatabaseType::SQLite {
            Url::parse(&connection_string)
                .map_err(|e| DbError::configuration(format!("Invalid URL: {e}")))?;
        }

        Ok(Self {
            db_type,
            connection_string,
        })
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask(&self.connection_string)
    }
}

impl FromStr for ConnectionConfig {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("db_type", &self.db_type)
            .field("connection_string", &self.masked_connection_string())
            .finish()
    }
}

fn mask(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("****")).is_ok() {
                url.to_string()
            } else {
                "<redacted>".to_string()
            }
        }
        Ok(_) => connection_string.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
