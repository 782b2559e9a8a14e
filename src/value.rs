//! Tagged SQL values crossing the pool boundary.
//!
//! Parameters arrive from the embedder as [`SqlValue`]s and are bound by
//! tag, never by host-language dynamic typing. Query results come back as
//! ordered maps of column name to [`SqlValue`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row: column name to value, in statement column order.
pub type Row = IndexMap<String, SqlValue>;

/// Typed SQL parameter or column value.
///
/// Booleans exist only on the binding side; SQLite stores them as integers,
/// so they never come back out of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
   Boolean(bool),
}

impl SqlValue {
   /// Returns true if this value is null.
   pub fn is_null(&self) -> bool {
      matches!(self, SqlValue::Null)
   }

   /// Attempts to get this value as an integer.
   pub fn as_integer(&self) -> Option<i64> {
      match self {
         SqlValue::Integer(i) => Some(*i),
         _ => None,
      }
   }

   /// Attempts to get this value as a float.
   pub fn as_real(&self) -> Option<f64> {
      match self {
         SqlValue::Real(r) => Some(*r),
         _ => None,
      }
   }

   /// Attempts to get this value as a string reference.
   pub fn as_text(&self) -> Option<&str> {
      match self {
         SqlValue::Text(s) => Some(s),
         _ => None,
      }
   }

   /// Attempts to get this value as a blob reference.
   pub fn as_blob(&self) -> Option<&[u8]> {
      match self {
         SqlValue::Blob(b) => Some(b),
         _ => None,
      }
   }
}

impl ToSql for SqlValue {
   fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
      Ok(match self {
         SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
         SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
         SqlValue::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
         SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
         SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
         SqlValue::Boolean(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
      })
   }
}

impl From<ValueRef<'_>> for SqlValue {
   fn from(value: ValueRef<'_>) -> Self {
      match value {
         ValueRef::Null => SqlValue::Null,
         ValueRef::Integer(i) => SqlValue::Integer(i),
         ValueRef::Real(r) => SqlValue::Real(r),
         ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
         ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
      }
   }
}

impl From<JsonValue> for SqlValue {
   fn from(value: JsonValue) -> Self {
      match value {
         JsonValue::Null => SqlValue::Null,
         JsonValue::Bool(b) => SqlValue::Boolean(b),
         JsonValue::Number(number) => {
            // Preserve integer precision by binding as i64 when possible
            if let Some(int_val) = number.as_i64() {
               SqlValue::Integer(int_val)
            } else if let Some(uint_val) = number.as_u64() {
               // Value too large for i64, use f64 (will lose precision)
               SqlValue::Real(uint_val as f64)
            } else {
               SqlValue::Real(number.as_f64().unwrap_or_default())
            }
         }
         JsonValue::String(s) => SqlValue::Text(s),
         // Arrays and objects are stored as their JSON text
         other => SqlValue::Text(other.to_string()),
      }
   }
}

impl Serialize for SqlValue {
   fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
      match self {
         SqlValue::Null => serializer.serialize_unit(),
         SqlValue::Integer(i) => serializer.serialize_i64(*i),
         SqlValue::Real(r) => serializer.serialize_f64(*r),
         SqlValue::Text(s) => serializer.serialize_str(s),
         SqlValue::Blob(b) => serializer.serialize_str(&BASE64.encode(b)),
         SqlValue::Boolean(b) => serializer.serialize_bool(*b),
      }
   }
}

impl<'de> Deserialize<'de> for SqlValue {
   /// Deserializes through JSON typing, so a base64 blob string comes back
   /// as `Text`. Blob parameters must be constructed directly.
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
      Ok(JsonValue::deserialize(deserializer)?.into())
   }
}
