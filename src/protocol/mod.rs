//! Viewer wire protocol
//!
//! Every WebSocket message is a text frame of the form `<tag>:<body>`:
//!
//! | Direction       | Tag          | Body                                 |
//! |-----------------|--------------|--------------------------------------|
//! | server → viewer | channel id   | base64 JPEG, no `=` padding          |
//! | server → viewer | `response`   | reply text for a control message     |
//! | viewer → server | message type | type-specific, JSON for form data    |

pub mod control;
pub mod message;

pub use control::{respond, ControlMessage};
pub use message::{frame_message, response_message, DELIMITER, RESPONSE_TAG};
