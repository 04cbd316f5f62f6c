use super::{Device, Position};
use crate::error::DecodeError;
use serde::Deserialize;
use serde_json::Value;

/// Push frame from the server socket
///
/// Every key is optional; `{}` is the server keep-alive and is valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamMessage {
    pub devices: Vec<Device>,
    pub positions: Vec<Position>,
    pub events: Vec<Value>,
}

impl StreamMessage {
    /// Keep-alive frames carry no entity data
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.positions.is_empty() && self.events.is_empty()
    }
}

/// Decode a text frame into a stream message.
///
/// Validation rules:
/// - Payload must be a JSON object
/// - `devices`, `positions`, `events` must be arrays when present
/// - Every element of `devices` / `positions` must decode
/// - Unknown keys are ignored
pub fn decode_message(text: &str) -> Result<StreamMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let object = match value {
        Value::Object(map) => map,
        _ => return Err(DecodeError::NotAnObject),
    };

    let mut message = StreamMessage::default();

    if let Some(devices) = object.get("devices") {
        message.devices = decode_array(devices, "devices")?;
    }
    if let Some(positions) = object.get("positions") {
        message.positions = decode_array(positions, "positions")?;
    }
    if let Some(events) = object.get("events") {
        match events {
            Value::Array(items) => message.events = items.clone(),
            _ => {
                return Err(DecodeError::InvalidField {
                    field: "events",
                    reason: "expected an array".to_string(),
                })
            }
        }
    }

    Ok(message)
}

fn decode_array<T>(value: &Value, field: &'static str) -> Result<Vec<T>, DecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    if !value.is_array() {
        return Err(DecodeError::InvalidField {
            field,
            reason: "expected an array".to_string(),
        });
    }

    Vec::<T>::deserialize(value).map_err(|e| DecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}
