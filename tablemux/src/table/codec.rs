//! Binary columnar encoding for view output and table input.
//!
//! The protocol only moves opaque bytes; which columnar format those bytes
//! hold is decided by the [`ColumnarCodec`] installed on the server. The
//! default [`JsonColumnarCodec`] writes `{"column": [values...]}` as UTF-8
//! JSON, which keeps tests and debugging readable.
//!
//! # Example
//!
//! ```rust
//! use tablemux::table::codec::{ColumnarCodec, JsonColumnarCodec};
//! use tablemux::table::TableData;
//! use serde_json::json;
//!
//! let codec = JsonColumnarCodec;
//! let row = json!({"a": 1}).as_object().cloned().unwrap_or_default();
//! let bytes = codec.encode(&["a".to_string()], &[row]).unwrap();
//! assert!(matches!(codec.decode(&bytes).unwrap(), TableData::Columns(_)));
//! ```

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::TableError;
use crate::table::{Row, TableData};

/// Pluggable columnar format for binary payloads.
pub trait ColumnarCodec: Send + Sync + 'static {
    /// Encode rows, restricted to `columns`, in columnar layout.
    ///
    /// # Errors
    ///
    /// Returns `TableError::InvalidData` if the rows cannot be represented.
    fn encode(&self, columns: &[String], rows: &[Row]) -> Result<Bytes, TableError>;

    /// Decode a binary payload into table input.
    ///
    /// # Errors
    ///
    /// Returns `TableError::InvalidData` if the payload is not in this format.
    fn decode(&self, payload: &[u8]) -> Result<TableData, TableError>;
}

/// JSON-columns codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonColumnarCodec;

impl ColumnarCodec for JsonColumnarCodec {
    fn encode(&self, columns: &[String], rows: &[Row]) -> Result<Bytes, TableError> {
        let mut out = Map::new();
        for column in columns {
            let values: Vec<Value> = rows
                .iter()
                .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            out.insert(column.clone(), Value::Array(values));
        }
        serde_json::to_vec(&out)
            .map(Bytes::from)
            .map_err(|e| TableError::InvalidData(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<TableData, TableError> {
        serde_json::from_slice(payload).map_err(|e| TableError::InvalidData(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn test_encode_is_columnar() {
        let codec = JsonColumnarCodec;
        let rows = vec![row(json!({"a": 1, "b": "x"})), row(json!({"a": 2}))];
        let bytes = codec
            .encode(&["a".to_string(), "b".to_string()], &rows)
            .expect("encode");

        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value, json!({"a": [1, 2], "b": ["x", null]}));
    }

    #[test]
    fn test_encode_projects_columns() {
        let codec = JsonColumnarCodec;
        let rows = vec![row(json!({"a": 1, "b": "x"}))];
        let bytes = codec.encode(&["b".to_string()], &rows).expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value, json!({"b": ["x"]}));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = JsonColumnarCodec.decode(b"\x00\x01not json");
        assert!(matches!(result, Err(TableError::InvalidData(_))));
    }

    #[test]
    fn test_decode_columns() {
        let data = JsonColumnarCodec
            .decode(br#"{"a":[1,2,3]}"#)
            .expect("decode");
        assert_eq!(data.into_rows().expect("rows").len(), 3);
    }
}
