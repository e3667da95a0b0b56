//! SQLite value to JSON decoding

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, Row, TypeInfo, Value, ValueRef};

use crate::{Error, Result};

/// Decode one column value to JSON.
///
/// Dispatches on the storage class of the value itself, not the declared
/// column type, so a `BOOLEAN` column holding `1` decodes to `1`. BLOBs are
/// base64 encoded.
pub(crate) fn to_json(v: SqliteValueRef<'_>) -> Result<JsonValue> {
   if v.is_null() {
      return Ok(JsonValue::Null);
   }

   let v = ValueRef::to_owned(&v);
   let type_info = v.type_info();
   let value = match type_info.name() {
      "TEXT" => JsonValue::String(v.try_decode::<String>()?),
      "REAL" => JsonValue::from(v.try_decode::<f64>()?),
      "INTEGER" => JsonValue::from(v.try_decode::<i64>()?),
      "BLOB" => JsonValue::String(STANDARD.encode(v.try_decode::<Vec<u8>>()?)),
      "NULL" => JsonValue::Null,
      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   Ok(value)
}

/// Decode a row to an ordered column-name map.
pub(crate) fn row_to_json(row: &SqliteRow) -> Result<IndexMap<String, JsonValue>> {
   let mut value = IndexMap::default();
   for (i, column) in row.columns().iter().enumerate() {
      let v = row.try_get_raw(i)?;
      let v = to_json(v)?;
      value.insert(column.name().to_string(), v);
   }
   Ok(value)
}
