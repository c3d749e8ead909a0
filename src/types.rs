//! Core data model types shared by every backend.
//!
//! Backends read into and write from an in-memory [`DataSet`]: a [`Schema`] (a list of typed
//! [`Field`]s) plus row-major [`Value`]s.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical data type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 64-bit signed integer.
    #[serde(alias = "int", alias = "integer")]
    Int64,
    /// 64-bit floating point number.
    #[serde(alias = "float", alias = "double")]
    Float64,
    /// Boolean.
    #[serde(alias = "boolean")]
    Bool,
    /// UTF-8 string.
    #[serde(alias = "str", alias = "string", alias = "text")]
    Utf8,
    /// Column with no observed values, so no concrete type yet.
    Null,
}

impl DataType {
    /// SQL column type used when materializing this type in SQLite.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Int64 => "INTEGER",
            Self::Float64 => "REAL",
            Self::Bool => "BOOLEAN",
            Self::Utf8 | Self::Null => "TEXT",
        }
    }

    /// Narrowest type able to hold values of both `self` and `other`.
    pub fn unify(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Null, b) => b,
            (a, Self::Null) => a,
            (Self::Int64, Self::Float64) | (Self::Float64, Self::Int64) => Self::Float64,
            _ => Self::Utf8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Bool => "bool",
            Self::Utf8 => "utf8",
            Self::Null => "null",
        };
        f.write_str(s)
    }
}

/// A single named, typed field in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field/column name.
    pub name: String,
    /// Field data type.
    pub data_type: DataType,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of fields describing the shape of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    /// Ordered list of fields.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Iterate field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the index of a field by name, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the field with `name`, if present.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// This schema with each field unified with the same-named field of `other`.
    pub fn widened(&self, other: &Schema) -> Schema {
        let fields = self
            .fields
            .iter()
            .map(|f| match other.field(&f.name) {
                Some(o) => Field::new(f.name.clone(), f.data_type.unify(o.data_type)),
                None => f.clone(),
            })
            .collect();
        Schema::new(fields)
    }
}

/// A single typed value in a [`DataSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing/empty value.
    Null,
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    Utf8(String),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The logical type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Bool(_) => DataType::Bool,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    /// Numeric view used for cross-type comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Stable textual key, used for distinct-value grouping.
    ///
    /// The type prefix keeps `Int64(1)` and `Utf8("1")` apart.
    pub fn group_key(&self) -> String {
        match self {
            Self::Null => "n:".to_string(),
            Self::Int64(v) => format!("i:{v}"),
            Self::Float64(v) => format!("f:{v}"),
            Self::Bool(v) => format!("b:{v}"),
            Self::Utf8(v) => format!("s:{v}"),
        }
    }

    /// Convert a JSON literal (as found in config files) into a value.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int64(i),
                None => n.as_f64().map(Self::Float64).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::Utf8(s.clone()),
            other => Self::Utf8(other.to_string()),
        }
    }

    /// Convert to a JSON value for the JSON backend.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Int64(v) => serde_json::Value::from(*v),
            Self::Float64(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Utf8(v) => serde_json::Value::String(v.clone()),
        }
    }
}

impl fmt::Display for Value {
    /// Text form used by the text backends.
    ///
    /// Whole floats keep a trailing `.0` so that re-reading infers `float64` again.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{v:.1}")
            }
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

/// In-memory tabular dataset.
///
/// Rows are stored as `Vec<Vec<Value>>` in the same order as the [`Schema`] fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSet {
    /// Schema describing row shape.
    pub schema: Schema,
    /// Row-major value storage.
    pub rows: Vec<Vec<Value>>,
}

impl DataSet {
    /// Create a dataset from schema and rows.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Number of rows in the dataset.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in schema order.
    pub fn column_names(&self) -> Vec<String> {
        self.schema.field_names().map(str::to_string).collect()
    }

    /// Zero-row dataset with the same columns and types.
    pub fn empty_like(&self) -> Self {
        Self::new(self.schema.clone(), Vec::new())
    }

    /// First `n` rows.
    pub fn head(&self, n: usize) -> Self {
        Self::new(self.schema.clone(), self.rows.iter().take(n).cloned().collect())
    }

    /// Values of one column, if present.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.schema.index_of(name)?;
        Some(self.rows.iter().map(|r| r.get(idx).unwrap_or(&Value::Null)).collect())
    }

    /// Distinct values of a column in first-appearance order.
    pub fn distinct_values(&self, name: &str) -> Option<Vec<Value>> {
        let values = self.column(name)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for v in values {
            if seen.insert(v.group_key()) {
                out.push(v.clone());
            }
        }
        Some(out)
    }

    /// Reshape this dataset to `schema`: columns are matched by name, missing columns become
    /// nulls, extra columns are dropped and values are coerced to the target types.
    pub fn align_to(&self, schema: &Schema) -> Self {
        let idxs: Vec<Option<usize>> = schema
            .fields
            .iter()
            .map(|f| self.schema.index_of(&f.name))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                schema
                    .fields
                    .iter()
                    .zip(&idxs)
                    .map(|(field, idx)| {
                        let v = idx.and_then(|i| row.get(i)).cloned().unwrap_or(Value::Null);
                        coerce_lossy(v, field.data_type)
                    })
                    .collect()
            })
            .collect();
        Self::new(schema.clone(), rows)
    }

    /// Widen the types of columns shared with `other` so both fit, converting stored values.
    ///
    /// Column set and order are unchanged.
    pub fn widen_to(&mut self, other: &Schema) {
        let widened = self.schema.widened(other);
        if widened != self.schema {
            *self = self.align_to(&widened);
        }
    }

    /// Append the rows of `other`, aligned to this dataset's columns.
    ///
    /// Shared columns are widened first, so no appended value is lost to a narrower type;
    /// columns typed [`DataType::Null`] adopt the type observed in `other`.
    pub fn append(&mut self, other: &Self) {
        self.widen_to(&other.schema);
        let aligned = other.align_to(&self.schema);
        self.rows.extend(aligned.rows);
    }

    /// Create a new dataset containing only rows that match `predicate`.
    ///
    /// The returned dataset preserves the original schema.
    pub fn filter_rows<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&[Value]) -> bool,
    {
        let rows = self
            .rows
            .iter()
            .filter(|row| predicate(row.as_slice()))
            .cloned()
            .collect();
        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    /// Add a column holding `value` in every row, replacing an existing column of that name.
    pub fn with_constant_column(mut self, name: &str, value: Value) -> Self {
        let data_type = value.data_type();
        match self.schema.index_of(name) {
            Some(idx) => {
                self.schema.fields[idx].data_type = data_type;
                for row in &mut self.rows {
                    if let Some(cell) = row.get_mut(idx) {
                        *cell = value.clone();
                    }
                }
            }
            None => {
                self.schema.fields.push(Field::new(name, data_type));
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
        self
    }
}

/// Coerce a value into `data_type`, producing `Null` when the value cannot be represented.
pub fn coerce_lossy(v: Value, data_type: DataType) -> Value {
    match (v, data_type) {
        (Value::Null, _) => Value::Null,
        (v, DataType::Null) => v,
        (v @ Value::Int64(_), DataType::Int64)
        | (v @ Value::Float64(_), DataType::Float64)
        | (v @ Value::Bool(_), DataType::Bool)
        | (v @ Value::Utf8(_), DataType::Utf8) => v,
        (Value::Int64(i), DataType::Float64) => Value::Float64(i as f64),
        (Value::Float64(f), DataType::Int64) if f.fract() == 0.0 => Value::Int64(f as i64),
        (v, DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Utf8(s), dt) => crate::backend::infer::parse_cell(&s, dt).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
