//! Row decoding.
//!
//! Rows from every backend are decoded into the same dynamically typed
//! [`Row`] (column name to JSON value, in column order) so the executor and
//! the row mapper never see driver types.
//!
//! Decoding is two-phase:
//! 1. [`categorize_type`] classifies the column's declared type
//! 2. a backend-specific decoder extracts the value for that category
//!
//! A non-null value no decoder accepts is an error, never a silent null.

use crate::models::{DatabaseType, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Temporal,
    Null,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "null" || lower == "void" {
        return TypeCategory::Null;
    }
    // SQLite's NUMERIC affinity is a float, elsewhere it is exact
    if lower.contains("decimal") || lower.contains("numeric") {
        return if db == DatabaseType::SQLite {
            TypeCategory::Float
        } else {
            TypeCategory::Decimal
        };
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") || lower == "tiny" {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.contains("timestamp") || lower.contains("date") || lower.starts_with("time") {
        return TypeCategory::Temporal;
    }
    TypeCategory::Text
}

/// Binary values are carried as base64 text.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(RawDecimal(<&str as Decode<sqlx::MySql>>::decode(value)?.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_from_binary(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as decimal text.
fn numeric_from_binary(buf: &[u8]) -> Result<String, BoxDynError> {
    let word = |i: usize| -> Result<i16, BoxDynError> {
        buf.get(i * 2..i * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| BoxDynError::from("truncated NUMERIC value"))
    };
    let ndigits = usize::try_from(word(0)?).unwrap_or(0);
    let weight = i32::from(word(1)?);
    let sign = word(2)? as u16;
    let dscale = usize::try_from(word(3)?).unwrap_or(0);
    match sign {
        0xC000 => return Ok("NaN".into()),
        0xD000 => return Ok("Infinity".into()),
        0xF000 => return Ok("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |pos: i32| -> i16 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for pos in 1..=weight {
            out.push_str(&format!("{:04}", digit(pos)));
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Conversion from a driver row into a [`Row`].
pub trait DecodeRow {
    /// Fails with [`sqlx::Error::ColumnDecode`] when a non-null value has no
    /// JSON rendering.
    fn decode_row(&self) -> Result<Row, sqlx::Error>;
}

macro_rules! impl_decode_row {
    ($row:ty, $db:expr, $decoder:path) => {
        impl DecodeRow for $row {
            fn decode_row(&self) -> Result<Row, sqlx::Error> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let category = categorize_type(col.type_info().name(), $db);
                        let value = $decoder(self, idx, category)?;
                        Ok::<_, sqlx::Error>((col.name().to_string(), value))
                    })
                    .collect()
            }
        }
    };
}

impl_decode_row!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_decode_row!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_decode_row!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

fn undecodable<C: Column>(column: &C) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: format!("{:?}", column.name()),
        source: format!("no JSON rendering for a {} value", column.type_info().name()).into(),
    }
}

/// Try each listed Rust type in turn; the first that decodes wins.
///
/// Only called on non-null values.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, $conv:expr, [$($ty:ty),+ $(,)?]) => {{
        let mut value: Option<JsonValue> = None;
        $(
            if value.is_none() {
                value = $row.try_get::<$ty, _>($idx).ok().map($conv);
            }
        )+
        value
    }};
}

/// DATE/TIME/TIMESTAMP columns rendered as ISO-8601 text.
macro_rules! decode_temporal {
    ($row:expr, $idx:expr) => {{
        use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
        first_decoded!(
            $row,
            $idx,
            |t: DateTime<Utc>| JsonValue::String(t.to_rfc3339()),
            [DateTime<Utc>]
        )
        .or_else(|| {
            first_decoded!(
                $row,
                $idx,
                |t| JsonValue::String(t.to_string()),
                [NaiveDateTime, NaiveDate, NaiveTime]
            )
        })
    }};
}

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(JsonValue::Null);
        }
        let value = match category {
            TypeCategory::Null => Some(JsonValue::Null),
            TypeCategory::Decimal => {
                first_decoded!(row, idx, |d: RawDecimal| JsonValue::String(d.0), [RawDecimal])
            }
            TypeCategory::Integer => first_decoded!(row, idx, JsonValue::from, [i64, u64]),
            TypeCategory::Boolean => first_decoded!(row, idx, JsonValue::Bool, [bool]),
            TypeCategory::Float => {
                first_decoded!(row, idx, |v| float_value(f64::from(v)), [f64, f32])
            }
            TypeCategory::Binary => {
                first_decoded!(row, idx, |v: Vec<u8>| encode_binary(&v), [Vec<u8>])
            }
            // MySQL JSON type should be decoded as serde_json::Value directly
            TypeCategory::Json => first_decoded!(row, idx, |v: JsonValue| v, [JsonValue]),
            TypeCategory::Temporal => decode_temporal!(row, idx),
            // ENUM, SET and geometry columns come back as bytes when not as text
            TypeCategory::Text => first_decoded!(row, idx, JsonValue::String, [String])
                .or_else(|| {
                    first_decoded!(row, idx, |v: Vec<u8>| encode_binary(&v), [Vec<u8>])
                }),
        };
        value.ok_or_else(|| undecodable(row.column(idx)))
    }
}

mod postgres {
    use super::*;
    use sqlx::postgres::PgTypeKind;
    use sqlx::postgres::types::PgInterval;
    use sqlx::types::Uuid;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(JsonValue::Null);
        }
        let value = match category {
            TypeCategory::Null => Some(JsonValue::Null),
            TypeCategory::Decimal => {
                first_decoded!(row, idx, |d: RawDecimal| JsonValue::String(d.0), [RawDecimal])
            }
            TypeCategory::Integer => first_decoded!(row, idx, JsonValue::from, [i64, i32, i16]),
            TypeCategory::Boolean => first_decoded!(row, idx, JsonValue::Bool, [bool]),
            TypeCategory::Float => {
                first_decoded!(row, idx, |v| float_value(f64::from(v)), [f64, f32])
            }
            TypeCategory::Binary => {
                first_decoded!(row, idx, |v: Vec<u8>| encode_binary(&v), [Vec<u8>])
            }
            TypeCategory::Json => first_decoded!(row, idx, |v: JsonValue| v, [JsonValue]),
            TypeCategory::Temporal => decode_temporal!(row, idx),
            TypeCategory::Text => first_decoded!(row, idx, JsonValue::String, [String])
                .or_else(|| {
                    first_decoded!(row, idx, |v: Uuid| JsonValue::String(v.to_string()), [Uuid])
                })
                .or_else(|| first_decoded!(row, idx, interval_value, [PgInterval]))
                .or_else(|| enum_label(row, idx)),
        };
        value
            .or_else(|| text_value(row, idx))
            .ok_or_else(|| undecodable(row.column(idx)))
    }

    fn interval_value(v: PgInterval) -> JsonValue {
        serde_json::json!({
            "months": v.months,
            "days": v.days,
            "microseconds": v.microseconds,
        })
    }

    /// Enum values are their label on the wire, in either format.
    fn enum_label(row: &PgRow, idx: usize) -> Option<JsonValue> {
        if !matches!(row.column(idx).type_info().kind(), PgTypeKind::Enum(_)) {
            return None;
        }
        row.try_get_unchecked::<String, _>(idx)
            .ok()
            .map(JsonValue::String)
    }

    /// Values of the simple query protocol arrive as text whatever their type.
    fn text_value(row: &PgRow, idx: usize) -> Option<JsonValue> {
        let raw = row.try_get_raw(idx).ok()?;
        match raw.format() {
            PgValueFormat::Text => raw.as_str().ok().map(|s| JsonValue::String(s.to_string())),
            PgValueFormat::Binary => None,
        }
    }
}

mod sqlite {
    use super::*;

    /// SQLite types values, not columns: the storage class decides how a value
    /// reads, and a declared BOOLEAN only turns integers into booleans.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        declared: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        let storage = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(JsonValue::Null);
            }
            categorize_type(raw.type_info().name(), DatabaseType::SQLite)
        };

        let value = match storage {
            TypeCategory::Integer if declared == TypeCategory::Boolean => {
                first_decoded!(row, idx, |v: i64| JsonValue::Bool(v != 0), [i64])
            }
            TypeCategory::Integer => first_decoded!(row, idx, |v: i64| JsonValue::from(v), [i64]),
            TypeCategory::Float => first_decoded!(row, idx, float_value, [f64]),
            TypeCategory::Binary => {
                first_decoded!(row, idx, |v: Vec<u8>| encode_binary(&v), [Vec<u8>])
            }
            _ => first_decoded!(row, idx, JsonValue::String, [String]),
        };
        value.ok_or_else(|| undecodable(row.column(idx)))
    }
}
