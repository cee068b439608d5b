//! Camera sources
//!
//! Every feed is reached through the [`CameraSource`] capability. The
//! scheduler never looks at the concrete variant:
//!
//! ```text
//!   CameraSource ──┬── LocalSource      (device thread ──► FrameMailbox)
//!                  ├── NetworkSource    (capture thread ──► FrameMailbox)
//!                  └── SyntheticSource  (procedural, always connected)
//! ```
//!
//! Sources that can re-establish a lost connection expose it through
//! [`CameraSource::reconnect`], an optional capability.
//!
//! Network streams are opened by a [`StreamOpener`] chosen from the URL
//! scheme: MJPEG over `http(s)://`, or `rtsp(s)://` through an ffmpeg
//! child process.

pub mod local;
pub mod mailbox;
pub mod mjpeg;
pub mod network;
pub mod rtsp;
pub mod synthetic;

pub use local::LocalSource;
pub use mailbox::FrameMailbox;
pub use mjpeg::{MjpegOpener, MjpegReader};
pub use network::{NetworkSource, NetworkSourceConfig};
pub use rtsp::{PipeReader, RtspOpener};
pub use synthetic::{synthesize, SyntheticKind, SyntheticSource};

use crate::error::SourceError;
use crate::frame::{ChannelId, Frame};

/// A producer of frames for one channel
pub trait CameraSource: Send {
    /// Best current knowledge of the connection; never blocks
    fn is_connected(&self) -> bool;

    /// Most recent frame, or `None` if nothing is available yet
    ///
    /// Must not block on network I/O.
    fn grab_frame(&mut self) -> Option<Frame>;

    /// Channel this source feeds; constant for the source's lifetime
    fn channel(&self) -> &ChannelId;

    /// Reconnect capability, if the source supports it
    fn reconnect(&mut self) -> Option<&mut dyn Reconnect> {
        None
    }

    /// Captured frames replaced before the scheduler read them
    fn frames_dropped(&self) -> u64 {
        0
    }
}

/// Optional capability of sources that can re-establish their stream
pub trait Reconnect {
    /// Start a reconnection attempt without blocking the caller
    fn request_reconnect(&mut self);
}

/// A blocking reader of decoded frames from a capture driver
pub trait FrameReader: Send {
    /// Read the next frame
    ///
    /// `Ok(None)` means the driver produced an empty frame; errors are
    /// transient read failures.
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Opens a [`FrameReader`] for a stream URL
pub trait StreamOpener: Send + Sync + 'static {
    /// Open the stream; may block on network I/O
    fn open(&self, url: &str) -> Result<Box<dyn FrameReader>, SourceError>;
}

impl<F> StreamOpener for F
where
    F: Fn(&str) -> Result<Box<dyn FrameReader>, SourceError> + Send + Sync + 'static,
{
    fn open(&self, url: &str) -> Result<Box<dyn FrameReader>, SourceError> {
        self(url)
    }
}

/// Opener that picks the stream driver from the URL scheme
#[derive(Debug, Clone, Default)]
pub struct UrlOpener {
    /// Driver for `http://` and `https://`
    pub http: MjpegOpener,
    /// Driver for `rtsp://` and `rtsps://`
    pub rtsp: RtspOpener,
}

impl StreamOpener for UrlOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameReader>, SourceError> {
        let parsed = url::Url::parse(url)?;
        match parsed.scheme() {
            "http" | "https" => self.http.open(url),
            "rtsp" | "rtsps" => self.rtsp.open(url),
            other => Err(SourceError::UnsupportedScheme(other.to_string())),
        }
    }
}
