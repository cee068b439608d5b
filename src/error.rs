//! Error types
//!
//! The crate-wide [`Error`] wraps I/O, transport and codec failures together
//! with the component errors. None of them is fatal to the process: callers
//! log and contain every variant.

use thiserror::Error as ThisError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, ThisError)]
pub enum Error {
    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Camera source could not be opened or read
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Frame could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Viewer sent a malformed control message
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure of a capture driver
#[derive(Debug, ThisError)]
pub enum SourceError {
    /// URL could not be parsed
    #[error("invalid stream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// No driver handles this URL scheme
    #[error("unsupported stream scheme: {0}")]
    UnsupportedScheme(String),

    /// Connecting to the stream endpoint or starting its helper process failed
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// HTTP request to the stream endpoint failed
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Endpoint answered with a non-success HTTP status
    #[error("unexpected HTTP status: {0}")]
    HttpStatus(String),

    /// Reading from an open stream failed
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    /// Remote end closed the stream
    #[error("stream ended")]
    EndOfStream,

    /// A received image could not be decoded
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),

    /// Local capture device failed
    #[error("capture device error: {0}")]
    Device(String),
}

/// Failure of the frame encoder
#[derive(Debug, ThisError)]
pub enum EncodeError {
    /// Frame has a zero dimension
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },

    /// Pixel buffer length does not match the frame geometry
    #[error("malformed pixel buffer: expected {expected} bytes, got {actual}")]
    MalformedBuffer { expected: usize, actual: usize },

    /// Codec rejected the frame
    #[error("codec rejected frame: {0}")]
    Codec(#[from] image::ImageError),
}

/// Malformed control message from a viewer
///
/// The `Display` text is the reply body sent back after `response:`.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ProtocolError {
    /// Message has no type delimiter
    #[error("Error: Invalid message format")]
    MissingDelimiter,

    /// Payload of a JSON message type is not a JSON object
    #[error("Error: Invalid JSON")]
    InvalidJson,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_text() {
        assert_eq!(
            ProtocolError::MissingDelimiter.to_string(),
            "Error: Invalid message format"
        );
        assert_eq!(ProtocolError::InvalidJson.to_string(), "Error: Invalid JSON");
    }

    #[test]
    fn test_encode_error_converts() {
        let err: Error = EncodeError::MalformedBuffer {
            expected: 12,
            actual: 3,
        }
        .into();

        assert!(matches!(err, Error::Encode(_)));
        assert_eq!(
            err.to_string(),
            "malformed pixel buffer: expected 12 bytes, got 3"
        );
    }
}
