//! Order task decoding.
//!
//! Message bodies are JSON objects carrying an order id and a destination
//! email. Producers serialize with PascalCase keys (`Id`, `Email`); lowercase
//! keys are accepted as well.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// A decoded order-confirmation task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderTask {
    /// Positive order identifier.
    #[serde(rename = "Id", alias = "id")]
    pub id: u64,
    /// Destination address. Not validated beyond being a string.
    #[serde(rename = "Email", alias = "email")]
    pub email: String,
}

/// The body could not be turned into an [`OrderTask`].
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Not well-formed JSON, not an object, or a field missing or mistyped.
    #[error("malformed order task: {0}")]
    Json(#[from] serde_json::Error),

    #[error("order id must be positive")]
    NonPositiveId,
}

/// Decode a message body into an [`OrderTask`].
///
/// The body must be a JSON object. Struct deserialization alone would also
/// accept a positional array such as `[42, "a@b.com"]`.
pub fn decode(body: &[u8]) -> Result<OrderTask, DecodeError> {
    let object: Map<String, Value> = serde_json::from_slice(body)?;
    let task: OrderTask = serde_json::from_value(Value::Object(object))?;
    if task.id == 0 {
        return Err(DecodeError::NonPositiveId);
    }
    Ok(task)
}
