//! RTSP stream driver
//!
//! RTSP sessions are handled by an `ffmpeg` child process that transcodes
//! the camera stream to MJPEG on its stdout. Frames are cut out of the pipe
//! by [`MjpegReader`]. The child is killed and reaped when the reader is
//! dropped, so a capture thread that exits never leaves an orphan behind.

use std::ffi::OsStr;
use std::io;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use url::Url;

use super::mjpeg::MjpegReader;
use super::{FrameReader, StreamOpener};
use crate::error::SourceError;
use crate::frame::Frame;

/// Opens RTSP streams through an `ffmpeg` child process
#[derive(Debug, Clone)]
pub struct RtspOpener {
    /// ffmpeg executable
    pub program: String,
    /// RTSP lower transport, `tcp` or `udp`
    pub transport: String,
    /// Socket I/O timeout; ffmpeg exits when the camera stalls this long
    pub io_timeout: Duration,
    /// MJPEG quantizer passed to `-q:v` (2 best, 31 worst)
    pub quantizer: u8,
    /// Largest accepted JPEG image
    pub max_frame_bytes: usize,
}

impl Default for RtspOpener {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            transport: "tcp".to_string(),
            io_timeout: Duration::from_secs(5),
            quantizer: 5,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl RtspOpener {
    /// Build the ffmpeg command for `url`
    pub fn command(&self, url: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["-nostdin", "-loglevel", "error"])
            .args(["-rtsp_transport", self.transport.as_str()])
            .args(["-timeout", self.io_timeout.as_micros().to_string().as_str()])
            .args(["-i", url])
            .args(["-an", "-f", "image2pipe", "-c:v", "mjpeg"])
            .args(["-q:v", self.quantizer.to_string().as_str()])
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }

    /// Start ffmpeg for an `rtsp://` or `rtsps://` URL
    ///
    /// Returns once the process is running; connection failures surface as
    /// the stream ending on the first read.
    pub fn connect(&self, url: &str) -> Result<PipeReader, SourceError> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "rtsp" | "rtsps") {
            return Err(SourceError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let reader = PipeReader::spawn(self.command(url), self.max_frame_bytes)?;
        tracing::debug!(
            host = parsed.host_str().unwrap_or(""),
            port = parsed.port_or_known_default(),
            pid = reader.id(),
            "RTSP transcoder started"
        );
        Ok(reader)
    }
}

impl StreamOpener for RtspOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameReader>, SourceError> {
        Ok(Box::new(self.connect(url)?))
    }
}

/// JPEG frames read from a child process's stdout
pub struct PipeReader {
    child: Child,
    frames: MjpegReader<ChildStdout>,
}

impl PipeReader {
    /// Spawn `command` with its stdout piped and read frames from it
    pub fn spawn(mut command: Command, max_frame_bytes: usize) -> Result<Self, SourceError> {
        command.stdout(Stdio::piped());
        let program = command.get_program().to_owned();

        let mut child = command.spawn().map_err(|e| {
            SourceError::Connect(io::Error::new(
                e.kind(),
                format!("failed to start {}: {}", program_name(&program), e),
            ))
        })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Connect(io::Error::other("child stdout was not captured")));
        };

        Ok(Self {
            child,
            frames: MjpegReader::new(stdout, max_frame_bytes),
        })
    }

    /// OS process id of the child
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

fn program_name(program: &OsStr) -> String {
    program.to_string_lossy().into_owned()
}

impl FrameReader for PipeReader {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.frames.read_frame()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
