//!
//! Host Value Representation
//!
//! `Value` is the closed set of host values that cross the binding in either
//! direction. Its cases line up with the engine's storage classes, plus
//! `Bool` (bound as 0/1) and the split between `Number` (double-precision,
//! the default decoding of integer columns) and `Integer` (exact 64-bit,
//! produced only when `QueryOptions::use_big_int` is set).
//!
//! JSON conversion is the entry point for untyped host data such as worker
//! requests. Objects and arrays that are not byte arrays have no binding and
//! are rejected with `InvalidBindType`.
//!

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde::Deserialize;

use crate::error::SqlError;

/// Largest integer a double holds exactly (2^53).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_992;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Number(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

/// Native storage class of a column or argument, read per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

impl ColumnType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ColumnType::Integer,
            2 => ColumnType::Float,
            3 => ColumnType::Text,
            4 => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }
}

/// `Some(i)` when `n` is an integer that fits in 32 bits.
pub fn exact_i32(n: f64) -> Option<i32> {
    if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
        Some(n as i32)
    } else {
        None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Number(i as f64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Blob(b.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

fn json_bytes(items: &[serde_json::Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

impl TryFrom<serde_json::Value> for Value {
    type Error = SqlError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as Json;

        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(b)),
            Json::String(s) => Ok(Value::Text(s)),
            Json::Number(n) => match n.as_i64() {
                Some(i) if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 => Ok(Value::Integer(i)),
                _ => n
                    .as_f64()
                    .map(Value::Number)
                    .ok_or_else(|| SqlError::InvalidBindType(n.to_string())),
            },
            Json::Array(items) => match json_bytes(&items) {
                Some(bytes) => Ok(Value::Blob(bytes)),
                None => Err(SqlError::InvalidBindType(Json::Array(items).to_string())),
            },
            other @ Json::Object(_) => Err(SqlError::InvalidBindType(other.to_string())),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            // Whole doubles go out as integers so `1.0` reads back as `1`.
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 => {
                serializer.serialize_i64(*n as i64)
            }
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for byte in bytes {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
        }
    }
}

/// Bind parameters: 1-based positions, or names including their prefix
/// (`:a`, `$a`, `@a`).
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Named(IndexMap<String, Value>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Params::Positional(values) => values.len(),
            Params::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `null` means no parameters; arrays are positional, objects named.
    pub fn from_json(json: serde_json::Value) -> Result<Option<Self>, SqlError> {
        use serde_json::Value as Json;

        match json {
            Json::Null => Ok(None),
            Json::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(|values| Some(Params::Positional(values))),
            Json::Object(map) => map
                .into_iter()
                .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(|map| Some(Params::Named(map))),
            other => Err(SqlError::InvalidBindType(other.to_string())),
        }
    }
}

/// Per-call decoding options (`{"useBigInt": true}` on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub use_big_int: bool,
}

impl QueryOptions {
    pub fn big_int() -> Self {
        Self { use_big_int: true }
    }
}

/// One row-producing statement's columns and accumulated rows.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            values: Vec::new(),
        }
    }
}

/// A decoded row keyed by column name, in column order.
pub type Row = IndexMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_type_codes() {
        assert_eq!(ColumnType::from_code(1), ColumnType::Integer);
        assert_eq!(ColumnType::from_code(2), ColumnType::Float);
        assert_eq!(ColumnType::from_code(3), ColumnType::Text);
        assert_eq!(ColumnType::from_code(4), ColumnType::Blob);
        assert_eq!(ColumnType::from_code(5), ColumnType::Null);
        assert_eq!(ColumnType::from_code(42), ColumnType::Null);
    }

    #[test]
    fn test_exact_i32() {
        assert_eq!(exact_i32(42.0), Some(42));
        assert_eq!(exact_i32(-0.0), Some(0));
        assert_eq!(exact_i32(i32::MAX as f64), Some(i32::MAX));
        assert_eq!(exact_i32(i32::MAX as f64 + 1.0), None);
        assert_eq!(exact_i32(1.5), None);
        assert_eq!(exact_i32(f64::NAN), None);
        assert_eq!(exact_i32(f64::INFINITY), None);
    }

    #[test]
    fn test_json_to_value() {
        assert_eq!(Value::try_from(json!(null)).unwrap(), Value::Null);
        assert_eq!(Value::try_from(json!(true)).unwrap(), Value::Bool(true));
        assert_eq!(Value::try_from(json!(3)).unwrap(), Value::Number(3.0));
        assert_eq!(Value::try_from(json!(2.5)).unwrap(), Value::Number(2.5));
        assert_eq!(Value::try_from(json!("a")).unwrap(), Value::Text("a".into()));
        assert_eq!(
            Value::try_from(json!(9_007_199_254_740_993i64)).unwrap(),
            Value::Integer(9_007_199_254_740_993)
        );
        assert_eq!(
            Value::try_from(json!([1, 2, 255])).unwrap(),
            Value::Blob(vec![1, 2, 255])
        );
    }

    #[test]
    fn test_json_without_binding_is_rejected() {
        let err = Value::try_from(json!({"a": 1})).unwrap_err();
        assert!(matches!(err, SqlError::InvalidBindType(_)));

        let err = Value::try_from(json!([1, "two"])).unwrap_err();
        assert!(matches!(err, SqlError::InvalidBindType(_)));

        let err = Value::try_from(json!([256])).unwrap_err();
        assert!(matches!(err, SqlError::InvalidBindType(_)));
    }

    #[test]
    fn test_params_from_json() {
        assert_eq!(Params::from_json(json!(null)).unwrap(), None);

        let positional = Params::from_json(json!([1, "x", null])).unwrap().unwrap();
        assert_eq!(
            positional,
            Params::Positional(vec![Value::Number(1.0), Value::Text("x".into()), Value::Null])
        );

        let named = Params::from_json(json!({":a": 1, "$b": "y"})).unwrap().unwrap();
        assert_eq!(named.len(), 2);
        assert!(matches!(named, Params::Named(_)));

        assert!(Params::from_json(json!("SELECT")).is_err());
        assert!(Params::from_json(json!([{"nested": true}])).is_err());
    }

    #[test]
    fn test_value_serialization() {
        let row = vec![
            Value::Null,
            Value::Number(1.0),
            Value::Number(1.5),
            Value::Integer(9_007_199_254_740_993),
            Value::Bool(false),
            Value::Text("t".into()),
            Value::Blob(vec![0, 7]),
        ];
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"[null,1,1.5,9007199254740993,false,"t",[0,7]]"#
        );
    }

    #[test]
    fn test_query_options_from_config() {
        let opts: QueryOptions = serde_json::from_value(json!({"useBigInt": true})).unwrap();
        assert!(opts.use_big_int);
        let opts: QueryOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(opts, QueryOptions::default());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Number(4.0).as_i64(), Some(4));
        assert_eq!(Value::Number(4.5).as_i64(), None);
        assert_eq!(Value::Integer(9).as_f64(), Some(9.0));
        assert_eq!(Value::from("s").as_str(), Some("s"));
        assert_eq!(Value::from(vec![1u8]).as_bytes(), Some(&[1u8][..]));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(7i32), Value::Number(7.0));
        assert_eq!(Value::Bool(true).type_name(), "boolean");
    }
}
