//! JPEG frame encoder
//!
//! Each channel compresses with one of two fixed quality profiles. Frames
//! are validated before they reach the codec, so a malformed buffer comes
//! back as an [`EncodeError`] instead of a panic.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::EncodeError;
use crate::frame::{ChannelId, EncodedPayload, Frame, PixelFormat};

/// Compression profile of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityProfile {
    /// Bandwidth-sensitive channels
    Low,
    /// Everything else
    #[default]
    High,
}

impl QualityProfile {
    /// JPEG quality factor (1-100)
    pub fn jpeg_quality(self) -> u8 {
        match self {
            QualityProfile::Low => 55,
            QualityProfile::High => 75,
        }
    }
}

impl std::fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityProfile::Low => write!(f, "low (q{})", self.jpeg_quality()),
            QualityProfile::High => write!(f, "high (q{})", self.jpeg_quality()),
        }
    }
}

/// Compress a frame with the channel's profile
pub fn encode(frame: &Frame, channel: &ChannelId, profile: QualityProfile) -> Result<EncodedPayload, EncodeError> {
    let jpeg = encode_jpeg(frame, profile.jpeg_quality())?;
    Ok(EncodedPayload::new(channel.clone(), Bytes::from(jpeg)))
}

/// Compress a frame to JPEG at the given quality
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(EncodeError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }

    let expected = frame.expected_len();
    if frame.data.len() != expected {
        return Err(EncodeError::MalformedBuffer {
            expected,
            actual: frame.data.len(),
        });
    }

    let color = match frame.format {
        PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        PixelFormat::Gray8 => ExtendedColorType::L8,
    };

    let mut buf = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode(
        &frame.data,
        frame.width,
        frame.height,
        color,
    )?;
    Ok(buf)
}
