//! Row to caller type mapping.
//!
//! Columns are matched to struct fields by name, case-insensitively, with an
//! exact match taking precedence. Rows with a single column decode straight
//! into scalars (`i64`, `String`, `Option<T>`...), and tuples take columns in
//! order. Anything `serde_json` can deserialize from the matched values works.

use crate::error::{DbError, DbResult};
use crate::models::{ResultSet, Row};
use serde::de::{DeserializeOwned, Deserializer, Visitor};
use serde_json::Value as JsonValue;
use std::collections::{HashSet, VecDeque};

/// Decode one row into `U`.
pub fn from_row<U: DeserializeOwned>(row: Row) -> DbResult<U> {
    U::deserialize(RowDeserializer { row }).map_err(|source| DbError::Mapping {
        type_name: std::any::type_name::<U>().to_string(),
        source,
    })
}

/// Decode every row of a result set into `U`, in order.
pub fn from_rows<U: DeserializeOwned>(rows: ResultSet) -> DbResult<Vec<U>> {
    rows.into_iter().map(from_row).collect()
}

struct RowDeserializer {
    row: Row,
}

impl RowDeserializer {
    /// The lone value of a single-column row, otherwise the row as an object.
    fn into_value(self) -> JsonValue {
        if self.row.len() == 1 {
            if let Some((_, value)) = self.row.into_iter().next() {
                return value;
            }
            return JsonValue::Null;
        }
        JsonValue::Object(self.row)
    }
}

/// Rename columns to the struct field they answer to.
fn match_fields(row: Row, fields: &[&str]) -> Row {
    let exact: HashSet<String> = row
        .keys()
        .filter(|column| fields.contains(&column.as_str()))
        .cloned()
        .collect();

    row.into_iter()
        .map(|(column, value)| {
            if exact.contains(&column) {
                return (column, value);
            }
            let field = fields
                .iter()
                .find(|field| field.eq_ignore_ascii_case(&column) && !exact.contains(**field));
            match field {
                Some(field) => (field.to_string(), value),
                None => (column, value),
            }
        })
        .collect()
}

impl<'de> Deserializer<'de> for RowDeserializer {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.into_value().deserialize_any(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let all_null = self.row.values().all(JsonValue::is_null);
        if self.row.is_empty() || (self.row.len() == 1 && all_null) {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        JsonValue::Array(self.row.into_iter().map(|(_, v)| v).collect()).deserialize_seq(visitor)
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        JsonValue::Object(self.row).deserialize_map(visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        JsonValue::Object(match_fields(self.row, fields)).deserialize_struct(name, fields, visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.into_value().deserialize_enum(name, variants, visitor)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct identifier ignored_any
    }
}

/// Ordered result sets from one multi-result command.
///
/// Sets are read front to back, each exactly once, mirroring the driver's
/// sequential result protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSets {
    sets: VecDeque<ResultSet>,
}

impl ResultSets {
    pub fn new(sets: Vec<ResultSet>) -> Self {
        Self { sets: sets.into() }
    }

    /// Number of sets not yet read.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// True once every set has been read.
    pub fn is_consumed(&self) -> bool {
        self.sets.is_empty()
    }

    /// Next set, undecoded.
    pub fn read_rows(&mut self) -> DbResult<ResultSet> {
        self.sets
            .pop_front()
            .ok_or_else(|| DbError::invalid_input("All result sets have already been read"))
    }

    /// Decode the next set into `U`.
    pub fn read<U: DeserializeOwned>(&mut self) -> DbResult<Vec<U>> {
        from_rows(self.read_rows()?)
    }

    /// First row of the next set, if any. The rest of that set is discarded.
    pub fn read_first<U: DeserializeOwned>(&mut self) -> DbResult<Option<U>> {
        self.read_rows()?.into_iter().next().map(from_row).transpose()
    }

    /// Remaining sets in order.
    pub fn into_inner(self) -> Vec<ResultSet> {
        self.sets.into()
    }
}

impl IntoIterator for ResultSets {
    type Item = ResultSet;
    type IntoIter = std::collections::vec_deque::IntoIter<ResultSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.sets.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        id: i64,
        first_name: String,
        nickname: Option<String>,
    }

    #[test]
    fn test_struct_case_insensitive_columns() {
        let person: Person = from_row(row(json!({
            "ID": 7,
            "First_Name": "Ann",
            "NICKNAME": null
        })))
        .unwrap();
        assert_eq!(
            person,
            Person {
                id: 7,
                first_name: "Ann".into(),
                nickname: None
            }
        );
    }

    #[test]
    fn test_exact_column_wins() {
        #[derive(Deserialize)]
        struct Item {
            id: i64,
        }
        let item: Item = from_row(row(json!({ "ID": 1, "id": 2 }))).unwrap();
        assert_eq!(item.id, 2);
    }

    #[test]
    fn test_extra_columns_ignored() {
        let person: Person = from_row(row(json!({
            "id": 1,
            "first_name": "Bo",
            "nickname": "B",
            "created_at": "2024-01-01"
        })))
        .unwrap();
        assert_eq!(person.nickname.as_deref(), Some("B"));
    }

    #[test]
    fn test_serde_rename_respected() {
        #[derive(Deserialize)]
        struct Renamed {
            #[serde(rename = "PersonId")]
            id: i64,
        }
        let r: Renamed = from_row(row(json!({ "personid": 3 }))).unwrap();
        assert_eq!(r.id, 3);
    }

    #[test]
    fn test_single_column_scalar() {
        let count: i64 = from_row(row(json!({ "COUNT(*)": 42 }))).unwrap();
        assert_eq!(count, 42);
        let name: String = from_row(row(json!({ "name": "x" }))).unwrap();
        assert_eq!(name, "x");
    }

    #[test]
    fn test_single_column_option() {
        let missing: Option<i64> = from_row(row(json!({ "v": null }))).unwrap();
        assert_eq!(missing, None);
        let present: Option<i64> = from_row(row(json!({ "v": 5 }))).unwrap();
        assert_eq!(present, Some(5));
    }

    #[test]
    fn test_tuple_by_column_order() {
        let t: (String, i64) = from_row(row(json!({ "name": "a", "n": 2 }))).unwrap();
        assert_eq!(t, ("a".to_string(), 2));
    }

    #[test]
    fn test_map_target_keeps_order() {
        let m: serde_json::Map<String, JsonValue> =
            from_row(row(json!({ "b": 1, "a": 2 }))).unwrap();
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_type_mismatch_is_mapping_error() {
        let err = from_row::<Person>(row(json!({ "id": "seven", "first_name": "A" }))).unwrap_err();
        match err {
            DbError::Mapping { type_name, .. } => assert!(type_name.ends_with("Person")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field() {
        assert!(from_row::<Person>(row(json!({ "id": 1 }))).is_err());
    }

    #[test]
    fn test_result_sets_read_in_order() {
        let mut sets = ResultSets::new(vec![
            vec![row(json!({ "id": 1, "first_name": "A", "nickname": null }))],
            vec![row(json!({ "total": 9 }))],
        ]);
        assert_eq!(sets.len(), 2);
        let people: Vec<Person> = sets.read().unwrap();
        assert_eq!(people[0].id, 1);
        let total: Option<i64> = sets.read_first().unwrap();
        assert_eq!(total, Some(9));
        assert!(sets.is_consumed());
        assert!(sets.read_rows().is_err());
    }

    #[test]
    fn test_read_first_of_empty_set() {
        let mut sets = ResultSets::new(vec![vec![]]);
        let first: Option<Person> = sets.read_first().unwrap();
        assert!(first.is_none());
    }
}
