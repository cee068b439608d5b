//! Outbound message formatting

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

use crate::frame::EncodedPayload;

/// Separates the tag from the body
pub const DELIMITER: char = ':';

/// Tag of replies to control messages
pub const RESPONSE_TAG: &str = "response";

/// Format a frame message: `<channel>:<base64 payload>`
pub fn frame_message(payload: &EncodedPayload) -> String {
    let channel = payload.channel.as_str();
    let mut message = String::with_capacity(channel.len() + 1 + payload.len().div_ceil(3) * 4);
    message.push_str(channel);
    message.push(DELIMITER);
    STANDARD_NO_PAD.encode_string(&payload.data, &mut message);
    message
}

/// Format a reply: `response:<text>`
pub fn response_message(text: impl std::fmt::Display) -> String {
    format!("{}{}{}", RESPONSE_TAG, DELIMITER, text)
}
