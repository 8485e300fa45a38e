//! Table-valued parameters.
//!
//! A slice of serializable records becomes a [`DataTable`]: one column per
//! serialized field, in declaration order, and one row per record. None of the
//! supported backends has a native table type, so the table travels as a
//! single JSON array of row objects (`jsonb` on PostgreSQL, `JSON` on MySQL)
//! that the procedure unpacks with `jsonb_to_recordset` / `JSON_TABLE`.

use crate::error::{DbError, DbResult};
use crate::models::{Parameter, QueryParam};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

/// Parameter name a table is bound under unless the caller picks another.
pub const DEFAULT_TABLE_PARAMETER: &str = "rows";

/// Column type, inferred from the serialized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Json,
    /// Every value in the column was null.
    Unknown,
}

impl ColumnType {
    fn of(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Unknown,
            JsonValue::Bool(_) => Self::Boolean,
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            JsonValue::Number(_) => Self::Float,
            JsonValue::String(_) => Self::Text,
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json,
        }
    }

    /// Combine with another value's type; `None` on conflict.
    fn merge(self, other: Self) -> Option<Self> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Self::Unknown, t) | (t, Self::Unknown) => Some(t),
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Some(Self::Float),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Rows with a fixed column layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: Vec<TableColumn>,
    rows: Vec<Vec<JsonValue>>,
}

impl DataTable {
    /// Build a table from records.
    ///
    /// Every record must serialize to a map. Fields absent from some records
    /// are null there. An empty slice gives an empty table with no columns.
    pub fn from_items<U: Serialize>(items: &[U]) -> DbResult<Self> {
        let type_name = std::any::type_name::<U>();
        let mut table = Self::default();

        for (index, item) in items.iter().enumerate() {
            let value = serde_json::to_value(item).map_err(|source| DbError::Conversion {
                type_name: type_name.to_string(),
                message: format!("record {index} could not be serialized"),
                source: Some(source),
            })?;
            let JsonValue::Object(fields) = value else {
                return Err(DbError::conversion(
                    type_name,
                    format!(
                        "record {index} serialized to {}, expected a struct or map",
                        kind(&value)
                    ),
                ));
            };
            table.push_record(type_name, index, fields)?;
        }

        Ok(table)
    }

    fn push_record(
        &mut self,
        type_name: &str,
        index: usize,
        fields: Map<String, JsonValue>,
    ) -> DbResult<()> {
        let mut row = vec![JsonValue::Null; self.columns.len()];
        for (name, value) in fields {
            let position = match self.columns.iter().position(|c| c.name == name) {
                Some(position) => position,
                None => {
                    self.columns.push(TableColumn {
                        name,
                        column_type: ColumnType::Unknown,
                    });
                    for existing in &mut self.rows {
                        existing.push(JsonValue::Null);
                    }
                    row.push(JsonValue::Null);
                    self.columns.len() - 1
                }
            };

            let column = &mut self.columns[position];
            let observed = ColumnType::of(&value);
            column.column_type = column.column_type.merge(observed).ok_or_else(|| {
                DbError::conversion(
                    type_name,
                    format!(
                        "column '{}' is {:?} but record {index} holds {:?}",
                        column.name, column.column_type, observed
                    ),
                )
            })?;
            row[position] = value;
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<JsonValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The table as a JSON array of row objects, columns in table order.
    pub fn to_json(&self) -> JsonValue {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object: Map<String, JsonValue> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect();
                JsonValue::Object(object)
            })
            .collect();
        JsonValue::Array(rows)
    }

    /// Bind the whole table as one named parameter.
    pub fn to_parameter(&self, name: impl Into<String>) -> Parameter {
        Parameter::new(name, QueryParam::Json(self.to_json()))
    }
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Line {
        sku: String,
        qty: i64,
        price: f64,
        note: Option<String>,
    }

    fn line(sku: &str, qty: i64, price: f64, note: Option<&str>) -> Line {
        Line {
            sku: sku.into(),
            qty,
            price,
            note: note.map(Into::into),
        }
    }

    #[test]
    fn test_columns_follow_declaration_order() {
        let table = DataTable::from_items(&[line("a", 1, 2.5, None), line("b", 2, 3.0, Some("x"))])
            .unwrap();
        let names: Vec<_> = table.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["sku", "qty", "price", "note"]);
        let types: Vec<_> = table.columns().iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Text,
                ColumnType::Integer,
                ColumnType::Float,
                ColumnType::Text
            ]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0][3], JsonValue::Null);
    }

    #[test]
    fn test_empty_input() {
        let table = DataTable::from_items::<Line>(&[]).unwrap();
        assert!(table.is_empty());
        assert!(table.columns().is_empty());
        assert_eq!(table.to_json(), json!([]));
    }

    #[test]
    fn test_integer_widens_to_float() {
        let items = vec![json!({ "v": 1 }), json!({ "v": 1.5 })];
        let table = DataTable::from_items(&items).unwrap();
        assert_eq!(table.columns()[0].column_type, ColumnType::Float);
    }

    #[test]
    fn test_conflicting_types_rejected() {
        let items = vec![json!({ "v": 1 }), json!({ "v": "one" })];
        let err = DataTable::from_items(&items).unwrap_err();
        assert!(matches!(err, DbError::Conversion { .. }));
        assert!(err.to_string().contains("column 'v'"));
    }

    #[test]
    fn test_non_struct_element_rejected() {
        let err = DataTable::from_items(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DbError::Conversion { .. }));
        assert!(err.to_string().contains("expected a struct or map"));
    }

    #[test]
    fn test_unserializable_element_rejected() {
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1);
        let err = DataTable::from_items(&[bad]).unwrap_err();
        assert!(matches!(err, DbError::Conversion { source: Some(_), .. }));
    }

    #[test]
    fn test_late_fields_backfilled() {
        let items = vec![json!({ "a": 1 }), json!({ "a": 2, "b": true })];
        let table = DataTable::from_items(&items).unwrap();
        assert_eq!(table.rows()[0], vec![json!(1), JsonValue::Null]);
        assert_eq!(table.columns()[1].column_type, ColumnType::Boolean);
    }

    #[test]
    fn test_to_parameter() {
        let table = DataTable::from_items(&[line("a", 1, 2.0, None)]).unwrap();
        let param = table.to_parameter(DEFAULT_TABLE_PARAMETER);
        assert_eq!(param.bare_name(), "rows");
        assert_eq!(
            param.value,
            QueryParam::Json(json!([{ "sku": "a", "qty": 1, "price": 2.0, "note": null }]))
        );
    }
}
