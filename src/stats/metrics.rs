//! Statistics for the frame pipeline and the listener

use std::time::{Duration, Instant};

/// Frame pipeline throughput over one reporting window
#[derive(Debug, Clone)]
pub struct ThroughputStats {
    /// Start of the current window
    pub window_started: Instant,
    /// Scheduler ticks
    pub ticks: u64,
    /// Frames produced (source or fallback)
    pub frames_processed: u64,
    /// Frames produced by a fallback generator
    pub fallback_frames: u64,
    /// Fresh encodes
    pub encodes: u64,
    /// Cached payloads resent without encoding
    pub cache_reuses: u64,
    /// Frames the encoder rejected
    pub encode_failures: u64,
    /// Bytes produced by fresh encodes
    pub bytes_encoded: u64,
    /// Messages queued to viewers
    pub messages_delivered: u64,
    /// Messages dropped because a viewer queue was full
    pub messages_dropped: u64,
    /// Captured frames replaced in a source mailbox before being served
    pub capture_dropped: u64,
}

impl ThroughputStats {
    /// Start a new window at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            window_started: now,
            ticks: 0,
            frames_processed: 0,
            fallback_frames: 0,
            encodes: 0,
            cache_reuses: 0,
            encode_failures: 0,
            bytes_encoded: 0,
            messages_delivered: 0,
            messages_dropped: 0,
            capture_dropped: 0,
        }
    }

    /// Length of the window up to `now`
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.window_started)
    }

    /// Average frames per second over the window
    pub fn fps(&self, now: Instant) -> f64 {
        let secs = self.elapsed(now).as_secs_f64();
        if secs > 0.0 {
            self.frames_processed as f64 / secs
        } else {
            0.0
        }
    }

    /// Share of frames served from the cache, in `0.0..=1.0`
    pub fn reuse_ratio(&self) -> f64 {
        let served = self.encodes + self.cache_reuses;
        if served > 0 {
            self.cache_reuses as f64 / served as f64
        } else {
            0.0
        }
    }

    /// Encoded bitrate in bits per second over the window
    pub fn bitrate(&self, now: Instant) -> u64 {
        let millis = self.elapsed(now).as_millis() as u64;
        if millis > 0 {
            (self.bytes_encoded * 8 * 1000) / millis
        } else {
            0
        }
    }

    /// Log the window and start a new one at `now`
    pub fn report_and_reset(&mut self, now: Instant, viewers: usize) {
        tracing::info!(
            fps = self.fps(now),
            frames = self.frames_processed,
            fallback = self.fallback_frames,
            encodes = self.encodes,
            reused = self.cache_reuses,
            encode_failures = self.encode_failures,
            bitrate = self.bitrate(now),
            delivered = self.messages_delivered,
            dropped = self.messages_dropped,
            capture_dropped = self.capture_dropped,
            viewers,
            "Frame pipeline statistics"
        );
        *self = Self::new(now);
    }
}

/// Listener-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Total connections accepted
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// Connections refused by the connection limit
    pub rejected_connections: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}
