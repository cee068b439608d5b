//! Network stream source
//!
//! A [`NetworkSource`] owns a dedicated capture thread that opens the stream,
//! then loops on blocking reads and publishes each decoded frame into a
//! [`FrameMailbox`]. The scheduler only ever copies out of the mailbox, so
//! `grab_frame` never touches the network.
//!
//! Reconnection is driven from outside: the capture loop gives up after too
//! many consecutive failed reads and reports the source disconnected; the
//! scheduler's health check then calls [`Reconnect::request_reconnect`],
//! which spawns a fresh capture thread with the original URL.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::mailbox::FrameMailbox;
use super::{CameraSource, FrameReader, Reconnect, StreamOpener};
use crate::frame::{ChannelId, Frame};

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct NetworkSourceConfig {
    /// Sleep after a failed read before retrying
    pub read_failure_backoff: Duration,

    /// Sleep after the driver returned an empty frame
    pub empty_frame_backoff: Duration,

    /// Consecutive failed reads after which the source reports disconnected
    /// (0 = never give up)
    pub max_consecutive_failures: u32,
}

impl Default for NetworkSourceConfig {
    fn default() -> Self {
        Self {
            read_failure_backoff: Duration::from_millis(20),
            empty_frame_backoff: Duration::from_millis(5),
            max_consecutive_failures: 100,
        }
    }
}

impl NetworkSourceConfig {
    /// Set the number of consecutive failures tolerated
    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Set the retry backoff after a failed read
    pub fn read_failure_backoff(mut self, backoff: Duration) -> Self {
        self.read_failure_backoff = backoff;
        self
    }
}

/// State shared with the capture thread
#[derive(Debug, Default)]
struct Shared {
    mailbox: FrameMailbox,
    connected: AtomicBool,
}

/// A source backed by a network stream and its own capture thread
pub struct NetworkSource {
    channel: ChannelId,
    url: String,
    opener: Arc<dyn StreamOpener>,
    config: NetworkSourceConfig,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    attempts: AtomicU64,
}

impl NetworkSource {
    /// Create the source and start the first connection attempt
    ///
    /// Returns immediately; the stream is opened on the capture thread.
    pub fn new(
        channel: ChannelId,
        url: impl Into<String>,
        opener: impl StreamOpener,
        config: NetworkSourceConfig,
    ) -> Self {
        let mut source = Self {
            channel,
            url: url.into(),
            opener: Arc::new(opener),
            config,
            shared: Arc::new(Shared::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            attempts: AtomicU64::new(0),
        };
        source.start_stream();
        source
    }

    /// Connection URL (credentials included)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Whether a capture thread is still alive
    pub fn is_capturing(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Spawn a capture thread for the configured URL
    ///
    /// Does nothing if a capture thread is still running. Returns whether a
    /// new thread was started. Never blocks on the network.
    pub fn start_stream(&mut self) -> bool {
        if self.is_capturing() {
            tracing::debug!(channel = %self.channel, "Capture thread still running, not restarting");
            return false;
        }

        // The previous thread has already exited, so this join cannot block.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let running = Arc::new(AtomicBool::new(true));
        self.running = Arc::clone(&running);
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let channel = self.channel.clone();
        let url = self.url.clone();
        let opener = Arc::clone(&self.opener);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name(format!("capture-{}", channel))
            .spawn(move || {
                let reader = match opener.open(&url) {
                    Ok(reader) => reader,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Failed to open network stream");
                        shared.connected.store(false, Ordering::Release);
                        return;
                    }
                };

                shared.mailbox.clear();
                shared.connected.store(true, Ordering::Release);
                tracing::info!(channel = %channel, "Network stream opened");

                capture_loop(&channel, reader, &running, &shared, &config);

                shared.connected.store(false, Ordering::Release);
                tracing::info!(channel = %channel, "Capture loop ended");
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Failed to spawn capture thread");
                false
            }
        }
    }

    /// Signal the capture thread to stop and wait for it to exit
    ///
    /// Blocks until the current read returns. Never call this from inside a
    /// scheduler tick.
    pub fn stop_stream(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(channel = %self.channel, "Capture thread panicked");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
    }
}

/// Read frames until stopped or the stream is deemed lost
///
/// The reader is dropped before returning, which releases the stream handle
/// before the owning thread can be joined.
fn capture_loop(
    channel: &ChannelId,
    mut reader: Box<dyn FrameReader>,
    running: &AtomicBool,
    shared: &Shared,
    config: &NetworkSourceConfig,
) {
    let mut failures = 0u32;

    while running.load(Ordering::Acquire) {
        match reader.read_frame() {
            Ok(Some(frame)) if !frame.is_empty() => {
                failures = 0;
                shared.mailbox.publish(frame);
            }
            Ok(_) => thread::sleep(config.empty_frame_backoff),
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::trace!(channel = %channel, error = %e, failures, "Frame read failed");

                if config.max_consecutive_failures > 0 && failures >= config.max_consecutive_failures {
                    tracing::warn!(
                        channel = %channel,
                        failures,
                        error = %e,
                        "Too many failed reads, marking stream disconnected"
                    );
                    break;
                }
                thread::sleep(config.read_failure_backoff);
            }
        }
    }

    drop(reader);
}

impl CameraSource for NetworkSource {
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

    fn reconnect(&mut self) -> Option<&mut dyn Reconnect> {
        Some(self)
    }

    fn frames_dropped(&self) -> u64 {
        self.shared.mailbox.overwritten()
    }
}

impl Reconnect for NetworkSource {
    fn request_reconnect(&mut self) {
        tracing::info!(channel = %self.channel, attempt = self.attempts() + 1, "Attempting stream reconnection");
        self.start_stream();
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        self.stop_stream();
    }
}
