//! Control messages from viewers
//!
//! Viewers send `<type>:<payload>` text frames. Only `AllFormData` has a
//! structured payload (a JSON object); every other type is acknowledged
//! by name. Malformed messages get an error reply, never a disconnect.

use serde_json::{Map, Value};

use super::message::{response_message, DELIMITER};
use crate::error::ProtocolError;

/// Type tag of bulk form data
pub const FORM_DATA: &str = "AllFormData";

/// A parsed control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage<'a> {
    /// Bulk form data as a JSON object
    FormData(Map<String, Value>),
    /// Any other message type, acknowledged by name
    Other { kind: &'a str, payload: &'a str },
}

impl<'a> ControlMessage<'a> {
    /// Split on the first delimiter and decode the payload of known types
    pub fn parse(text: &'a str) -> Result<Self, ProtocolError> {
        let (kind, payload) = text.split_once(DELIMITER).ok_or(ProtocolError::MissingDelimiter)?;

        match kind {
            FORM_DATA => match serde_json::from_str::<Value>(payload) {
                Ok(Value::Object(fields)) => Ok(ControlMessage::FormData(fields)),
                _ => Err(ProtocolError::InvalidJson),
            },
            _ => Ok(ControlMessage::Other { kind, payload }),
        }
    }

    /// Reply body for this message
    pub fn reply(&self) -> String {
        match self {
            ControlMessage::FormData(_) => "Form data received".to_string(),
            ControlMessage::Other { kind, .. } => format!("Message received: {}", kind),
        }
    }
}

/// Handle one text frame and build the full `response:` reply
pub fn respond(text: &str) -> String {
    match ControlMessage::parse(text) {
        Ok(message) => {
            match &message {
                ControlMessage::FormData(fields) => {
                    tracing::debug!(fields = fields.len(), "Form data received");
                }
                ControlMessage::Other { kind, payload } => {
                    tracing::debug!(kind = %kind, len = payload.len(), "Unhandled message type");
                }
            }
            response_message(message.reply())
        }
        Err(e) => {
            tracing::debug!(error = %e, "Malformed control message");
            response_message(e)
        }
    }
}
