//! Scalar types, values and row batches exchanged with executable functions.
//!
//! The query engine owns the real SQL type system; this module only models
//! what crosses the pipe: a handful of scalar types, an optional null, and
//! ordered rows of values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Type of an argument, parameter or result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Bool,
    UInt64,
    Int64,
    Float64,
    String,
    Nullable(Box<DataType>),
}

impl DataType {
    /// Whether `NULL` is a legal value of this type.
    pub fn is_nullable(&self) -> bool {
        matches!(self, Self::Nullable(_))
    }

    /// The type with any `Nullable` wrapper removed.
    pub fn base(&self) -> &DataType {
        match self {
            Self::Nullable(inner) => inner.base(),
            other => other,
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(inner) = s
            .strip_prefix("Nullable(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let inner: DataType = inner.parse()?;
            if inner.is_nullable() {
                return Err(Error::Config(format!("nested Nullable type: {}", s)));
            }
            return Ok(Self::Nullable(Box::new(inner)));
        }

        match s {
            "Bool" | "Boolean" => Ok(Self::Bool),
            "UInt8" | "UInt16" | "UInt32" | "UInt64" => Ok(Self::UInt64),
            "Int8" | "Int16" | "Int32" | "Int64" => Ok(Self::Int64),
            "Float32" | "Float64" => Ok(Self::Float64),
            "String" => Ok(Self::String),
            other => Err(Error::Config(format!("unsupported type: {}", other))),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("Bool"),
            Self::UInt64 => f.write_str("UInt64"),
            Self::Int64 => f.write_str("Int64"),
            Self::Float64 => f.write_str("Float64"),
            Self::String => f.write_str("String"),
            Self::Nullable(inner) => write!(f, "Nullable({})", inner),
        }
    }
}

/// A single scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parse the unescaped textual form of a value of type `ty`.
    pub fn from_text(ty: &DataType, text: &str) -> Result<Self> {
        let parsed = match ty.base() {
            DataType::Bool => match text {
                "true" | "1" => Some(Self::Bool(true)),
                "false" | "0" => Some(Self::Bool(false)),
                _ => None,
            },
            DataType::UInt64 => text.parse().ok().map(Self::UInt64),
            DataType::Int64 => text.parse().ok().map(Self::Int64),
            DataType::Float64 => text.parse().ok().map(Self::Float64),
            DataType::String => Some(Self::String(text.to_string())),
            DataType::Nullable(_) => None,
        };
        parsed.ok_or_else(|| Error::Format(format!("cannot parse {:?} as {}", text, ty)))
    }

    /// Convert a JSON value into a value of type `ty`.
    pub fn from_json(ty: &DataType, json: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;

        let mismatch = || Error::Format(format!("cannot read JSON {} as {}", json, ty));
        match (ty.base(), json) {
            (_, Json::Null) if ty.is_nullable() => Ok(Self::Null),
            (_, Json::Null) => Err(Error::Format(format!("NULL returned for non-nullable {}", ty))),
            (DataType::Bool, Json::Bool(b)) => Ok(Self::Bool(*b)),
            (DataType::UInt64, Json::Number(n)) => n.as_u64().map(Self::UInt64).ok_or_else(mismatch),
            (DataType::Int64, Json::Number(n)) => n.as_i64().map(Self::Int64).ok_or_else(mismatch),
            (DataType::Float64, Json::Number(n)) => n.as_f64().map(Self::Float64).ok_or_else(mismatch),
            (DataType::String, Json::String(s)) => Ok(Self::String(s.clone())),
            // Numbers quoted as strings are accepted, as JSONEachRow readers do.
            (_, Json::String(s)) => Self::from_text(ty, s),
            _ => Err(mismatch()),
        }
    }

    /// Render as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::UInt64(v) => Json::from(*v),
            Self::Int64(v) => Json::from(*v),
            Self::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
        }
    }

    /// Convert this value to `ty`, parsing strings where needed.
    ///
    /// Used to check parameters, where a quoted literal such as `'2'` is an
    /// acceptable `UInt64`.
    pub fn coerce(&self, ty: &DataType) -> Result<Self> {
        let mismatch = || Error::Parameter(format!("value {} is not a valid {}", self, ty));
        match (self, ty.base()) {
            (Self::Null, _) if ty.is_nullable() => Ok(Self::Null),
            (Self::Null, _) => Err(mismatch()),
            (Self::String(s), DataType::String) => Ok(Self::String(s.clone())),
            (Self::String(s), _) => Self::from_text(ty, s).map_err(|_| mismatch()),
            (Self::Bool(b), DataType::Bool) => Ok(Self::Bool(*b)),
            (Self::UInt64(v), DataType::UInt64) => Ok(Self::UInt64(*v)),
            (Self::UInt64(v), DataType::Int64) => {
                i64::try_from(*v).map(Self::Int64).map_err(|_| mismatch())
            }
            (Self::Int64(v), DataType::Int64) => Ok(Self::Int64(*v)),
            (Self::Int64(v), DataType::UInt64) => {
                u64::try_from(*v).map(Self::UInt64).map_err(|_| mismatch())
            }
            (Self::UInt64(v), DataType::Float64) => Ok(Self::Float64(*v as f64)),
            (Self::Int64(v), DataType::Float64) => Ok(Self::Float64(*v as f64)),
            (Self::Float64(v), DataType::Float64) => Ok(Self::Float64(*v)),
            (other, DataType::String) => Ok(Self::String(other.to_string())),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::UInt64(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::Float64(v) => write!(f, "{}", v),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::UInt64(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One row of values.
pub type Row = Vec<Value>;

/// Ordered rows sent to or received from a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Values of a single-column batch, such as a function result.
    pub fn single_column(&self) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(|row| row.first())
    }
}

impl From<Vec<Row>> for RowBatch {
    fn from(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

impl FromIterator<Row> for RowBatch {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for RowBatch {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_names() {
        assert_eq!("UInt64".parse::<DataType>().unwrap(), DataType::UInt64);
        assert_eq!("UInt8".parse::<DataType>().unwrap(), DataType::UInt64);
        assert_eq!(
            "Nullable(String)".parse::<DataType>().unwrap(),
            DataType::Nullable(Box::new(DataType::String))
        );
        assert!("Nullable(Nullable(String))".parse::<DataType>().is_err());
        assert!("Decimal(10, 2)".parse::<DataType>().is_err());
    }

    #[test]
    fn test_type_serde_uses_names() {
        let ty: DataType = serde_json::from_str("\"Nullable(UInt64)\"").unwrap();
        assert_eq!(ty.to_string(), "Nullable(UInt64)");
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"Nullable(UInt64)\"");
    }

    #[test]
    fn test_from_text() {
        assert_eq!(Value::from_text(&DataType::UInt64, "42").unwrap(), Value::UInt64(42));
        assert_eq!(Value::from_text(&DataType::Bool, "1").unwrap(), Value::Bool(true));
        assert!(Value::from_text(&DataType::UInt64, "-1").is_err());
        assert!(Value::from_text(&DataType::Int64, "abc").is_err());
    }

    #[test]
    fn test_from_json() {
        let nullable = DataType::Nullable(Box::new(DataType::UInt64));
        assert_eq!(
            Value::from_json(&nullable, &serde_json::Value::Null).unwrap(),
            Value::Null
        );
        assert!(Value::from_json(&DataType::UInt64, &serde_json::Value::Null).is_err());
        assert_eq!(
            Value::from_json(&DataType::UInt64, &serde_json::json!("7")).unwrap(),
            Value::UInt64(7)
        );
        assert!(Value::from_json(&DataType::UInt64, &serde_json::json!(true)).is_err());
    }

    #[test]
    fn test_coerce_parameters() {
        assert_eq!(Value::from("2").coerce(&DataType::UInt64).unwrap(), Value::UInt64(2));
        assert!(Value::from("test").coerce(&DataType::UInt64).is_err());
        assert!(Value::Int64(-1).coerce(&DataType::UInt64).is_err());
        assert_eq!(
            Value::UInt64(5).coerce(&DataType::String).unwrap(),
            Value::from("5")
        );
    }
}
