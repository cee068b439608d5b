//! MJPEG stream driver
//!
//! [`MjpegReader`] cuts JPEG images out of any byte stream: an HTTP
//! `multipart/x-mixed-replace` body, or raw concatenated JPEG such as an
//! encoder's stdout. Part headers and boundaries are skipped by scanning for
//! the SOI marker. An image then ends at the EOI marker found by walking the
//! segment lengths, so marker bytes inside APP segments (EXIF thumbnails)
//! or entropy-coded data never end a frame early.
//!
//! [`MjpegOpener`] opens `http://` and `https://` camera streams with a
//! blocking `reqwest` client. Credentials embedded in the URL are sent as
//! HTTP Basic authorization.

use std::io::{self, BufReader, Read};
use std::time::Duration;

use image::ImageFormat;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use super::{FrameReader, StreamOpener};
use crate::error::SourceError;
use crate::frame::Frame;

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

/// Restart markers carry no length
fn is_standalone(code: u8) -> bool {
    matches!(code, 0xD0..=0xD7 | TEM)
}

/// Blocking reader of JPEG frames from a byte stream
pub struct MjpegReader<R> {
    reader: BufReader<R>,
    image: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            image: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Read the bytes of the next complete JPEG image
    ///
    /// A partially received image is discarded on error.
    pub fn next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        self.image.clear();
        let result = self.read_image();
        if result.is_err() {
            self.image.clear();
        }
        result
    }

    fn read_image(&mut self) -> Result<Vec<u8>, SourceError> {
        self.seek_soi()?;
        self.push(&[MARKER, SOI])?;

        let mut code = self.next_marker()?;
        loop {
            match code {
                EOI => {
                    self.push(&[MARKER, EOI])?;
                    return Ok(std::mem::take(&mut self.image));
                }
                standalone if is_standalone(standalone) => {
                    self.push(&[MARKER, standalone])?;
                    code = self.next_marker()?;
                }
                SOS => {
                    self.copy_segment(SOS)?;
                    code = self.scan_entropy_data()?;
                }
                other => {
                    self.copy_segment(other)?;
                    code = self.next_marker()?;
                }
            }
        }
    }

    fn byte(&mut self) -> Result<u8, SourceError> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf).map_err(read_error)?;
        Ok(buf[0])
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), SourceError> {
        if self.image.len() + bytes.len() > self.max_frame_bytes {
            return Err(invalid_data("JPEG image exceeds size limit"));
        }
        self.image.extend_from_slice(bytes);
        Ok(())
    }

    /// Skip everything up to and including the next SOI marker
    fn seek_soi(&mut self) -> Result<(), SourceError> {
        let mut prev = 0u8;
        let mut skipped = 0usize;
        loop {
            let byte = self.byte()?;
            if prev == MARKER && byte == SOI {
                return Ok(());
            }
            skipped += 1;
            if skipped > self.max_frame_bytes {
                return Err(invalid_data("no JPEG image in stream"));
            }
            prev = byte;
        }
    }

    /// Read a marker, skipping fill bytes, and return its code
    fn next_marker(&mut self) -> Result<u8, SourceError> {
        if self.byte()? != MARKER {
            return Err(invalid_data("expected JPEG marker"));
        }
        loop {
            let code = self.byte()?;
            if code != MARKER {
                return Ok(code);
            }
        }
    }

    /// Copy a length-prefixed segment whose marker was just read
    fn copy_segment(&mut self, code: u8) -> Result<(), SourceError> {
        let hi = self.byte()?;
        let lo = self.byte()?;
        let length = u16::from_be_bytes([hi, lo]) as usize;
        if length < 2 {
            return Err(invalid_data("JPEG segment length too short"));
        }

        self.push(&[MARKER, code, hi, lo])?;
        let payload = length - 2;
        if self.image.len() + payload > self.max_frame_bytes {
            return Err(invalid_data("JPEG image exceeds size limit"));
        }
        let start = self.image.len();
        self.image.resize(start + payload, 0);
        self.reader.read_exact(&mut self.image[start..]).map_err(read_error)
    }

    /// Copy entropy-coded data up to the next real marker and return its code
    fn scan_entropy_data(&mut self) -> Result<u8, SourceError> {
        loop {
            let byte = self.byte()?;
            if byte != MARKER {
                self.push(&[byte])?;
                continue;
            }

            let mut code = self.byte()?;
            while code == MARKER {
                code = self.byte()?;
            }
            // Stuffed zero bytes and restart markers belong to the scan
            if code == 0x00 || matches!(code, 0xD0..=0xD7) {
                self.push(&[MARKER, code])?;
                continue;
            }
            return Ok(code);
        }
    }
}

impl<R: Read + Send> FrameReader for MjpegReader<R> {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let jpeg = self.next_jpeg()?;
        let decoded = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?;
        Ok(Some(Frame::from(decoded.to_rgb8())))
    }
}

fn read_error(e: io::Error) -> SourceError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SourceError::EndOfStream
    } else {
        SourceError::Read(e)
    }
}

fn invalid_data(message: &'static str) -> SourceError {
    SourceError::Read(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// Opens MJPEG streams over HTTP
#[derive(Debug, Clone)]
pub struct MjpegOpener {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Timeout of each read; bounds how long one read can block
    pub read_timeout: Duration,
    /// Largest accepted JPEG image
    pub max_frame_bytes: usize,
}

impl Default for MjpegOpener {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(2),
            max_frame_bytes: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl MjpegOpener {
    /// Send the request and validate the response status
    ///
    /// Blocks on the network; call it from a capture thread, never from
    /// inside the async runtime.
    pub fn connect(&self, url: &str) -> Result<MjpegReader<Response>, SourceError> {
        let mut url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SourceError::UnsupportedScheme(url.scheme().to_string()));
        }

        let username = url.username().to_string();
        let password = url.password().map(str::to_string);
        // Credentials go in the Authorization header, never in the request line or logs
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .user_agent(concat!("framecast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SourceError::Http)?;

        let mut request = client
            .get(url.as_str())
            .header(ACCEPT, "multipart/x-mixed-replace, image/jpeg");
        if !username.is_empty() {
            request = request.basic_auth(username, password);
        }

        let response = request.send().map_err(SourceError::Http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.to_string()));
        }

        tracing::debug!(
            url = %url,
            content_type = ?response.headers().get(CONTENT_TYPE),
            "MJPEG stream connected"
        );

        Ok(MjpegReader::new(response, self.max_frame_bytes))
    }
}

impl StreamOpener for MjpegOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameReader>, SourceError> {
        Ok(Box::new(self.connect(url)?))
    }
}
