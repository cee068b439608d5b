//! Local capture device source
//!
//! The device is opened and read on a dedicated thread, which publishes each
//! frame into a [`FrameMailbox`]; `grab_frame` only copies out of the slot.
//! With the `local-camera` feature the device is a native camera opened
//! through `nokhwa`. Device handles need not be `Send`: they are created on
//! the capture thread and never leave it.
//!
//! A device that stops delivering frames is not reopened. Once the capture
//! thread has exited the source reports disconnected for good.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::mailbox::FrameMailbox;
use super::CameraSource;
use crate::error::SourceError;
use crate::frame::{ChannelId, Frame};

/// Consecutive failed reads after which the device is considered gone
const MAX_CONSECUTIVE_FAILURES: u32 = 50;

const READ_FAILURE_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct Shared {
    mailbox: FrameMailbox,
    connected: AtomicBool,
}

/// A source backed by a local capture device
pub struct LocalSource {
    channel: ChannelId,
    device_index: u32,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LocalSource {
    /// A source whose device could not be opened
    pub fn disconnected(channel: ChannelId, device_index: u32) -> Self {
        Self {
            channel,
            device_index,
            shared: Arc::new(Shared::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start a capture thread that opens the device with `open` and then
    /// calls the returned reader until it fails for good
    ///
    /// Returns immediately. The source reports connected once `open`
    /// succeeds.
    pub fn spawn<O, R>(channel: ChannelId, device_index: u32, open: O) -> Self
    where
        O: FnOnce() -> Result<R, SourceError> + Send + 'static,
        R: FnMut() -> Result<Option<Frame>, SourceError>,
    {
        let mut source = Self::disconnected(channel, device_index);
        source.running.store(true, Ordering::Release);

        let channel = source.channel.clone();
        let shared = Arc::clone(&source.shared);
        let running = Arc::clone(&source.running);

        let spawned = thread::Builder::new()
            .name(format!("device-{}", device_index))
            .spawn(move || {
                let read = match open() {
                    Ok(read) => read,
                    Err(e) => {
                        tracing::warn!(channel = %channel, device = device_index, error = %e, "Local camera not connected");
                        return;
                    }
                };

                shared.connected.store(true, Ordering::Release);
                tracing::info!(channel = %channel, device = device_index, "Local camera connected");

                device_loop(&channel, read, &running, &shared);

                shared.connected.store(false, Ordering::Release);
                tracing::info!(channel = %channel, device = device_index, "Local camera capture ended");
            });

        match spawned {
            Ok(handle) => source.worker = Some(handle),
            Err(e) => {
                tracing::warn!(channel = %source.channel, error = %e, "Failed to spawn device thread");
            }
        }
        source
    }

    /// Open the capture device with the given index
    ///
    /// Failure is not fatal: the source reports disconnected.
    pub fn open(channel: ChannelId, device_index: u32) -> Self {
        open_device(channel, device_index)
    }

    /// Index of the capture device
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Whether the capture thread is still alive
    pub fn is_capturing(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }
}

fn device_loop<R>(channel: &ChannelId, mut read: R, running: &AtomicBool, shared: &Shared)
where
    R: FnMut() -> Result<Option<Frame>, SourceError>,
{
    let mut failures = 0u32;

    while running.load(Ordering::Acquire) {
        match read() {
            Ok(Some(frame)) if !frame.is_empty() => {
                failures = 0;
                shared.mailbox.publish(frame);
            }
            Ok(_) => {}
            Err(SourceError::EndOfStream) => {
                tracing::warn!(channel = %channel, "Capture device closed");
                break;
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(channel = %channel, error = %e, failures, "Device read failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::warn!(channel = %channel, failures, error = %e, "Capture device stopped responding");
                    break;
                }
                thread::sleep(READ_FAILURE_BACKOFF);
            }
        }
    }
}

#[cfg(feature = "local-camera")]
fn open_device(channel: ChannelId, device_index: u32) -> LocalSource {
    LocalSource::spawn(channel, device_index, move || {
        let mut camera = device::CameraReader::open(device_index)?;
        Ok(move || camera.read_frame())
    })
}

#[cfg(not(feature = "local-camera"))]
fn open_device(channel: ChannelId, device_index: u32) -> LocalSource {
    tracing::warn!(
        channel = %channel,
        device = device_index,
        "Built without the local-camera feature, device source stays disconnected"
    );
    LocalSource::disconnected(channel, device_index)
}

impl CameraSource for LocalSource {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn grab_frame(&mut self) -> Option<Frame> {
        if !self.is_connected() {
            return None;
        }
        self.shared.mailbox.latest()
    }

    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    fn frames_dropped(&self) -> u64 {
        self.shared.mailbox.overwritten()
    }
}

impl Drop for LocalSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(channel = %self.channel, "Device thread panicked");
            }
        }
    }
}

#[cfg(feature = "local-camera")]
mod device {
    //! nokhwa-backed camera reader, used only on the capture thread.

    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
    use nokhwa::Camera;

    use crate::error::SourceError;
    use crate::frame::{Frame, PixelFormat};

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 480;
    const FPS: u32 = 30;

    pub struct CameraReader {
        camera: Camera,
    }

    impl CameraReader {
        pub fn open(index: u32) -> Result<Self, SourceError> {
            let target = CameraFormat::new(Resolution::new(WIDTH, HEIGHT), FrameFormat::MJPEG, FPS);
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(target));

            let mut camera = Camera::new(CameraIndex::Index(index), requested)
                .map_err(|e| SourceError::Device(format!("failed to open camera: {e}")))?;
            camera
                .open_stream()
                .map_err(|e| SourceError::Device(format!("failed to open camera stream: {e}")))?;
            Ok(Self { camera })
        }

        /// Block until the camera delivers its next frame
        pub fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            let rgb = self
                .camera
                .frame()
                .and_then(|buffer| buffer.decode_image::<RgbFormat>())
                .map_err(|e| SourceError::Device(e.to_string()))?;
            let (w, h) = (rgb.width(), rgb.height());
            Ok(Some(Frame::new(w, h, PixelFormat::Rgb8, rgb.into_raw())))
        }
    }

    impl Drop for CameraReader {
        fn drop(&mut self) {
            let _ = self.camera.stop_stream();
        }
    }
}
