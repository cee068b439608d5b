//! Frame and payload types
//!
//! This module defines the identifiers for video channels, the raw raster
//! frames produced by sources, and the encoded payloads delivered to viewers.

use std::sync::Arc;

use bytes::Bytes;

/// Name of a logical video feed (e.g. "monitoring")
///
/// Cheap to clone; stable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    /// Create a new channel id
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Get the channel name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit interleaved red, green, blue
    Rgb8,
    /// 8-bit single channel luminance
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// An owned raster image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Row-major pixel data, no padding
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap an existing pixel buffer
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Create a frame filled with a single RGB color
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    /// Number of bytes the geometry requires
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }

    /// Whether the frame has no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Whether both frames share dimensions and pixel format
    pub fn same_geometry(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    /// Convert into an RGB image buffer
    ///
    /// Returns `None` if the buffer does not match the frame geometry.
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        if self.data.len() != self.expected_len() {
            return None;
        }
        match self.format {
            PixelFormat::Rgb8 => image::RgbImage::from_raw(self.width, self.height, self.data.clone()),
            PixelFormat::Gray8 => image::GrayImage::from_raw(self.width, self.height, self.data.clone())
                .map(|gray| image::DynamicImage::ImageLuma8(gray).to_rgb8()),
        }
    }

    /// Resize to the given dimensions with a bilinear filter
    ///
    /// Frames that already match, or whose buffer is malformed, are returned unchanged.
    pub fn resized(self, width: u32, height: u32) -> Frame {
        if (self.width, self.height) == (width, height) {
            return self;
        }
        match self.to_rgb_image() {
            Some(rgb) => Frame::from(image::imageops::resize(
                &rgb,
                width,
                height,
                image::imageops::FilterType::Triangle,
            )),
            None => self,
        }
    }
}

impl From<image::RgbImage> for Frame {
    fn from(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(width, height, PixelFormat::Rgb8, img.into_raw())
    }
}

/// A compressed frame ready for delivery
///
/// Cheap to clone due to `Bytes` reference counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Channel this payload belongs to
    pub channel: ChannelId,
    /// Compressed image bytes (JPEG)
    pub data: Bytes,
}

impl EncodedPayload {
    /// Create a payload
    pub fn new(channel: ChannelId, data: Bytes) -> Self {
        Self { channel, data }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
