//! Key/value payload text carried inside encrypted frames.
//!
//! DATA and LOG_DATA carry a JSON object mapping dataset names to a number,
//! or `null` when the value is currently invalid.  SETUP carries a JSON
//! object mapping setup keys to integers.  SETUP_CHANGE arrives either as
//! the same JSON object or in the query form servers send, terminated by
//! `/`.
//!
//! ```text
//! {"power":1250.5,"energy":null}
//! {"mode":2,"limit":4000}
//! ?mode=2&limit=4000/
//! ```

use std::collections::BTreeMap;

use crate::protocol::codec::ProtocolError;

/// Telemetry values keyed by dataset name.
pub type Values = BTreeMap<String, Option<f64>>;

/// Setup values keyed by setup key.
pub type SetupValues = BTreeMap<String, i64>;

/// Serialises telemetry values.  Non-finite numbers are written as `null`.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if serialisation fails.
pub fn encode_values(values: &Values) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(values).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Parses telemetry values.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for anything but a JSON
/// object of numbers and nulls.
pub fn decode_values(bytes: &[u8]) -> Result<Values, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Serialises setup values.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if serialisation fails.
pub fn encode_setup(values: &SetupValues) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(values).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Parses setup values from JSON or query form.  An empty payload is an
/// empty change set.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for anything but a JSON
/// object of integers or `key=integer` pairs.
pub fn decode_setup(bytes: &[u8]) -> Result<SetupValues, ProtocolError> {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(SetupValues::new());
    }
    if text.starts_with('{') {
        return serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()));
    }
    decode_setup_query(text)
}

// `?key=value&key2=value2/`; the leading `?` and trailing `/` are optional.
fn decode_setup_query(text: &str) -> Result<SetupValues, ProtocolError> {
    let query = text.split_once('?').map_or(text, |(_, rest)| rest);
    let query = query.split_once('/').map_or(query, |(head, _)| head);

    let mut values = SetupValues::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ProtocolError::MalformedPayload(format!("no value in {pair:?}")))?;
        let value = value.trim().parse::<i64>().map_err(|e| {
            ProtocolError::MalformedPayload(format!("setup value for {key:?}: {e}"))
        })?;
        values.insert(key.trim().to_string(), value);
    }
    Ok(values)
}
