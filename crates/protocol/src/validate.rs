//! Structural validation of inbound control messages.
//!
//! Each predicate checks that the value is an object, that the `type` tag
//! matches, and that every required field is present (not missing, not
//! `null`) with the right JSON type. Empty strings and zero are valid values.
//! Unknown fields are ignored. Cross-field rules belong to the transfer
//! admission policy, not here.
//!
//! `null` counts as absent everywhere: a required field set to `null` fails,
//! and an optional one (`deviceName`, `payload`) set to `null` is treated as
//! omitted, so a `ping` with `"payload": null` is answered by a `pong`
//! without a payload.

use serde_json::{Map, Value};

type Object = Map<String, Value>;

fn field<'a>(obj: &'a Object, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn is_string(obj: &Object, key: &str) -> bool {
    field(obj, key).is_some_and(Value::is_string)
}

fn is_optional_string(obj: &Object, key: &str) -> bool {
    field(obj, key).is_none_or(Value::is_string)
}

/// Sizes and counts are non-negative integers.
fn is_u64(obj: &Object, key: &str) -> bool {
    field(obj, key).is_some_and(|v| v.as_u64().is_some())
}

/// Chunk indices and counts travel as 32-bit values in binary frames.
fn is_u32(obj: &Object, key: &str) -> bool {
    field(obj, key)
        .and_then(Value::as_u64)
        .is_some_and(|n| n <= u64::from(u32::MAX))
}

fn typed<'a>(value: &'a Value, msg_type: &str) -> Option<&'a Object> {
    let obj = value.as_object()?;
    (obj.get("type").and_then(Value::as_str) == Some(msg_type)).then_some(obj)
}

/// `{type:"handshake", version, platform, appVersion, deviceName?}`.
pub fn is_valid_handshake(value: &Value) -> bool {
    typed(value, "handshake").is_some_and(|obj| {
        is_string(obj, "version")
            && is_string(obj, "platform")
            && is_string(obj, "appVersion")
            && is_optional_string(obj, "deviceName")
    })
}

/// `{type:"ping", payload?}`; the payload may be any JSON value.
pub fn is_valid_ping(value: &Value) -> bool {
    typed(value, "ping").is_some()
}

/// `{type:"file_start", transferId, fileName, fileSize, mimeType, checksum,
/// totalChunks, chunkSize}`.
pub fn is_valid_file_start(value: &Value) -> bool {
    typed(value, "file_start").is_some_and(|obj| {
        is_string(obj, "transferId")
            && is_string(obj, "fileName")
            && is_u64(obj, "fileSize")
            && is_string(obj, "mimeType")
            && is_string(obj, "checksum")
            && is_u32(obj, "totalChunks")
            && is_u64(obj, "chunkSize")
    })
}

/// `{type:"file_chunk", transferId, chunkIndex, data}` with base64 `data`.
pub fn is_valid_file_chunk(value: &Value) -> bool {
    typed(value, "file_chunk").is_some_and(|obj| {
        is_string(obj, "transferId") && is_u32(obj, "chunkIndex") && is_string(obj, "data")
    })
}

/// `{type:"file_end", transferId}`.
pub fn is_valid_file_end(value: &Value) -> bool {
    typed(value, "file_end").is_some_and(|obj| is_string(obj, "transferId"))
}
