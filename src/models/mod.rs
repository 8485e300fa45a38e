//! Data models for db-helper.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionConfig, DatabaseType};
pub use query::{
    CommandKind, CommandSpec, ParamType, Parameter, QueryParam, ResultSet, Row, render_parameters,
};
