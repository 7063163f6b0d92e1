//! Compact binary object encoding (CBOR).
//!
//! Every structured value that crosses the wire (handshake messages,
//! application calls and replies) is encoded with CBOR. CBOR items are
//! self-delimiting, so several records can be concatenated in a single HTTP
//! body or WebSocket frame and read back one at a time with [`read_value`].

use std::io::Cursor;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, SessionError};

/// Encode a value into a CBOR byte vector.
pub fn to_vec<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| SessionError::Codec(format!("failed to serialize CBOR payload: {e}")))?;
    Ok(buf)
}

/// Decode a value from a CBOR byte slice.
pub fn from_slice<T>(bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut cursor = Cursor::new(bytes);
    ciborium::de::from_reader(&mut cursor)
        .map_err(|e| SessionError::Codec(format!("failed to deserialize CBOR payload: {e}")))
}

/// Read exactly one CBOR item from the cursor, advancing it past the item.
pub fn read_value<T>(cursor: &mut Cursor<&[u8]>) -> Result<T>
where
    T: DeserializeOwned,
{
    ciborium::de::from_reader(cursor)
        .map_err(|e| SessionError::Codec(format!("malformed CBOR item: {e}")))
}

/// Encode raw bytes as a CBOR byte string.
pub fn byte_string(bytes: &[u8]) -> Result<Vec<u8>> {
    to_vec(&ciborium::Value::Bytes(bytes.to_vec()))
}

/// Read one CBOR byte string from the cursor.
pub fn read_byte_string(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    match read_value::<ciborium::Value>(cursor)? {
        ciborium::Value::Bytes(bytes) => Ok(bytes),
        other => Err(SessionError::Codec(format!(
            "expected byte string, found {}",
            value_kind(&other)
        ))),
    }
}

fn value_kind(value: &ciborium::Value) -> &'static str {
    match value {
        ciborium::Value::Integer(_) => "integer",
        ciborium::Value::Bytes(_) => "bytes",
        ciborium::Value::Float(_) => "float",
        ciborium::Value::Text(_) => "text",
        ciborium::Value::Bool(_) => "bool",
        ciborium::Value::Null => "null",
        ciborium::Value::Tag(..) => "tag",
        ciborium::Value::Array(_) => "array",
        ciborium::Value::Map(_) => "map",
        _ => "unknown",
    }
}
