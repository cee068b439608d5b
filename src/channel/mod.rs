//! Channel registry
//!
//! Each known channel has exactly one [`ChannelState`], created at startup
//! and owned by the scheduler. It bundles the channel's tunables, its camera
//! source, its cadence bookkeeping and its frame cache.

pub mod cache;

pub use cache::{difference_magnitude, has_changed, max_magnitude, CachedFrame, FrameOrigin};

use std::time::{Duration, Instant};

use crate::encoder::{self, QualityProfile};
use crate::error::EncodeError;
use crate::frame::{ChannelId, EncodedPayload, Frame, PixelFormat};
use crate::source::{
    synthesize, CameraSource, LocalSource, NetworkSource, NetworkSourceConfig, SyntheticKind, SyntheticSource,
    UrlOpener,
};

/// What feeds a channel
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    /// Network stream; credentials may be embedded in the URL
    Network { url: String },
    /// Local capture device by index
    LocalDevice { index: u32 },
    /// Permanent simulated feed with no backing device
    Synthetic(SyntheticKind),
}

/// Per-channel tunables, fixed at startup
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel name used in frame messages
    pub id: ChannelId,

    /// Source feeding the channel
    pub source: SourceConfig,

    /// Minimum time between frames
    pub interval: Duration,

    /// Difference magnitude above which a frame is re-encoded
    pub change_threshold: f64,

    /// Compression profile
    pub quality: QualityProfile,

    /// Placeholder shown while the source is down
    pub fallback: SyntheticKind,

    /// Size real-source frames are resized to before caching
    pub output_size: Option<(u32, u32)>,

    /// Whether the channel keeps the scheduler running even with its source down
    pub always_active: bool,
}

impl ChannelConfig {
    /// Create a channel with default tunables
    pub fn new(id: impl Into<ChannelId>, source: SourceConfig) -> Self {
        let always_active = matches!(source, SourceConfig::Synthetic(_));
        Self {
            id: id.into(),
            source,
            interval: Duration::from_millis(50),
            change_threshold: 15.3,
            quality: QualityProfile::High,
            fallback: SyntheticKind::ConnectionLost,
            output_size: None,
            always_active,
        }
    }

    /// Network monitoring camera: 25 fps, low quality, resized to 320x240
    pub fn monitoring(url: impl Into<String>) -> Self {
        Self::new("monitoring", SourceConfig::Network { url: url.into() })
            .interval(Duration::from_millis(40))
            .change_threshold(38.25) // 5% of the RGB magnitude range
            .quality(QualityProfile::Low)
            .fallback(SyntheticKind::ConnectionLost)
            .output_size(320, 240)
    }

    /// Industrial camera feed: 20 fps, high quality, simulated by default
    ///
    /// The simulated feed never disconnects, so the "connection lost"
    /// fallback only shows when the channel is pointed at a real device.
    pub fn basler() -> Self {
        Self::new("basler", SourceConfig::Synthetic(SyntheticKind::TestPattern))
            .interval(Duration::from_millis(50))
            .change_threshold(15.3) // 2%
            .quality(QualityProfile::High)
            .fallback(SyntheticKind::ConnectionLost)
            .always_active(true)
    }

    /// Set the source
    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    /// Set the minimum time between frames
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the change threshold
    pub fn change_threshold(mut self, threshold: f64) -> Self {
        self.change_threshold = threshold;
        self
    }

    /// Set the compression profile
    pub fn quality(mut self, quality: QualityProfile) -> Self {
        self.quality = quality;
        self
    }

    /// Set the fallback placeholder
    pub fn fallback(mut self, kind: SyntheticKind) -> Self {
        self.fallback = kind;
        self
    }

    /// Resize real-source frames to the given size
    pub fn output_size(mut self, width: u32, height: u32) -> Self {
        self.output_size = Some((width, height));
        self
    }

    /// Count the channel as active even with its source down
    pub fn always_active(mut self, always_active: bool) -> Self {
        self.always_active = always_active;
        self
    }

    /// Open the configured source
    ///
    /// Never fails: a source that cannot connect reports disconnected.
    pub fn open_source(&self, network: &NetworkSourceConfig) -> Box<dyn CameraSource> {
        match &self.source {
            SourceConfig::Network { url } => Box::new(NetworkSource::new(
                self.id.clone(),
                url.clone(),
                UrlOpener::default(),
                network.clone(),
            )),
            SourceConfig::LocalDevice { index } => Box::new(LocalSource::open(self.id.clone(), *index)),
            SourceConfig::Synthetic(kind) => Box::new(SyntheticSource::new(self.id.clone(), *kind)),
        }
    }
}

/// A frame produced for one tick, with its provenance
#[derive(Debug, Clone)]
pub struct ProducedFrame {
    /// The frame itself
    pub frame: Frame,
    /// Where it came from
    pub origin: FrameOrigin,
}

/// Payload handed to the broadcaster
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Encoded frame
    pub payload: EncodedPayload,
    /// Whether the cached payload was reused instead of re-encoding
    pub reused: bool,
}

/// Runtime state of one channel
pub struct ChannelState {
    config: ChannelConfig,
    source: Box<dyn CameraSource>,
    last_frame_at: Option<Instant>,
    failed: bool,
    cache: Option<CachedFrame>,
}

impl ChannelState {
    /// Create the state for a channel and its opened source
    pub fn new(config: ChannelConfig, source: Box<dyn CameraSource>) -> Self {
        let max = max_magnitude(PixelFormat::Rgb8.channels());
        if config.change_threshold >= max {
            tracing::warn!(
                channel = %config.id,
                threshold = config.change_threshold,
                max,
                "Change threshold can never be exceeded, frames will only re-encode on geometry change"
            );
        }

        Self {
            config,
            source,
            last_frame_at: None,
            failed: false,
            cache: None,
        }
    }

    /// Channel id
    pub fn id(&self) -> &ChannelId {
        &self.config.id
    }

    /// Channel tunables
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether the last frame attempt failed
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether the source is currently connected
    pub fn is_connected(&self) -> bool {
        self.source.is_connected()
    }

    /// Captured frames the source replaced before they were served
    pub fn frames_dropped(&self) -> u64 {
        self.source.frames_dropped()
    }

    /// Whether the channel counts as active for the idle rule
    pub fn is_active(&self) -> bool {
        self.config.always_active || self.source.is_connected()
    }

    /// When the last frame was served
    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    /// Cached frame and payload, if any
    pub fn cached(&self) -> Option<&CachedFrame> {
        self.cache.as_ref()
    }

    /// Whether the channel's interval has elapsed at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_frame_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.config.interval,
        }
    }

    /// Produce this tick's frame
    ///
    /// Uses the source when it is connected and has a frame; otherwise marks
    /// the channel failed and renders the fallback placeholder. The
    /// last-frame timestamp is updated either way.
    pub fn produce(&mut self, now: Instant, counter: u64) -> ProducedFrame {
        self.last_frame_at = Some(now);

        let grabbed = if self.source.is_connected() {
            self.source.grab_frame()
        } else {
            None
        };

        match grabbed {
            Some(frame) => {
                if self.failed {
                    tracing::info!(channel = %self.config.id, "Source delivering frames again");
                }
                self.failed = false;
                let frame = match self.config.output_size {
                    Some((w, h)) => frame.resized(w, h),
                    None => frame,
                };
                ProducedFrame {
                    frame,
                    origin: FrameOrigin::Source,
                }
            }
            None => {
                if !self.failed {
                    tracing::debug!(channel = %self.config.id, "No frame from source, using fallback");
                }
                self.failed = true;
                ProducedFrame {
                    frame: synthesize(self.config.fallback, counter),
                    origin: FrameOrigin::Fallback,
                }
            }
        }
    }

    /// Reuse the cached payload or encode the frame
    ///
    /// On a fresh encode the raw frame and payload replace the cache as one
    /// update. On failure the previous cache stays untouched.
    pub fn prepare(&mut self, produced: ProducedFrame) -> Result<Prepared, EncodeError> {
        if let Some(cached) = &self.cache {
            let same_origin = cached.origin == produced.origin;
            if same_origin && !has_changed(&produced.frame, Some(&cached.frame), self.config.change_threshold) {
                return Ok(Prepared {
                    payload: cached.payload.clone(),
                    reused: true,
                });
            }
        }

        let payload = encoder::encode(&produced.frame, &self.config.id, self.config.quality)?;
        self.cache = Some(CachedFrame {
            frame: produced.frame,
            payload: payload.clone(),
            origin: produced.origin,
        });

        Ok(Prepared {
            payload,
            reused: false,
        })
    }

    /// Ask a disconnected source to reconnect, if it can
    ///
    /// Returns whether a request was issued.
    pub fn check_connection(&mut self) -> bool {
        if self.source.is_connected() {
            return false;
        }
        match self.source.reconnect() {
            Some(reconnect) => {
                tracing::debug!(channel = %self.config.id, "Source disconnected, requesting reconnect");
                reconnect.request_reconnect();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("id", &self.config.id)
            .field("connected", &self.source.is_connected())
            .field("failed", &self.failed)
            .field("last_frame_at", &self.last_frame_at)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::source::Reconnect;

    /// Scriptable source shared with the test through handles
    pub(crate) struct MockSource {
        pub channel: ChannelId,
        pub connected: Arc<AtomicBool>,
        pub frame: Option<Frame>,
        pub reconnects: Arc<AtomicU32>,
        pub dropped: Arc<AtomicU64>,
    }

    impl MockSource {
        pub(crate) fn new(channel: &str, connected: bool, frame: Option<Frame>) -> Self {
            Self {
                channel: ChannelId::new(channel),
                connected: Arc::new(AtomicBool::new(connected)),
                frame,
                reconnects: Arc::new(AtomicU32::new(0)),
                dropped: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl CameraSource for MockSource {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn grab_frame(&mut self) -> Option<Frame> {
            self.frame.clone()
        }

        fn channel(&self) -> &ChannelId {
            &self.channel
        }

        fn reconnect(&mut self) -> Option<&mut dyn Reconnect> {
            Some(self)
        }

        fn frames_dropped(&self) -> u64 {
            self.dropped.load(Ordering::SeqCst)
        }
    }

    impl Reconnect for MockSource {
        fn request_reconnect(&mut self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state(connected: bool, frame: Option<Frame>) -> ChannelState {
        let config = ChannelConfig::new("cam", SourceConfig::Network { url: "http://cam".into() })
            .interval(Duration::from_millis(40))
            .change_threshold(10.0);
        ChannelState::new(config, Box::new(MockSource::new("cam", connected, frame)))
    }

    #[test]
    fn test_presets() {
        let monitoring = ChannelConfig::monitoring("http://cam/video");
        assert_eq!(monitoring.id.as_str(), "monitoring");
        assert_eq!(monitoring.interval, Duration::from_millis(40));
        assert_eq!(monitoring.quality, QualityProfile::Low);
        assert_eq!(monitoring.output_size, Some((320, 240)));
        assert!(!monitoring.always_active);

        let basler = ChannelConfig::basler();
        assert_eq!(basler.interval, Duration::from_millis(50));
        assert_eq!(basler.quality, QualityProfile::High);
        assert!(basler.always_active);
        assert_eq!(basler.fallback, SyntheticKind::ConnectionLost);
        assert!(basler.change_threshold < monitoring.change_threshold);

        // Both thresholds are reachable fractions of the magnitude range
        let max = max_magnitude(PixelFormat::Rgb8.channels());
        assert!((monitoring.change_threshold / max - 0.05).abs() < 1e-9);
        assert!((basler.change_threshold / max - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ChannelConfig::new("x", SourceConfig::LocalDevice { index: 2 })
            .interval(Duration::from_millis(10))
            .change_threshold(1.5)
            .quality(QualityProfile::Low)
            .fallback(SyntheticKind::Blank)
            .output_size(64, 48)
            .always_active(true);

        assert_eq!(config.source, SourceConfig::LocalDevice { index: 2 });
        assert_eq!(config.interval, Duration::from_millis(10));
        assert_eq!(config.change_threshold, 1.5);
        assert_eq!(config.fallback, SyntheticKind::Blank);
        assert_eq!(config.output_size, Some((64, 48)));
        assert!(config.always_active);
    }

    #[test]
    fn test_synthetic_source_is_always_active() {
        let config = ChannelConfig::new("sim", SourceConfig::Synthetic(SyntheticKind::TestPattern));
        assert!(config.always_active);

        let source = config.open_source(&NetworkSourceConfig::default());
        assert!(source.is_connected());
        assert_eq!(source.channel().as_str(), "sim");
    }

    #[test]
    fn test_cadence() {
        let mut channel = state(true, Some(Frame::filled(8, 8, [9, 9, 9])));
        let t0 = Instant::now();

        assert!(channel.is_due(t0));
        channel.produce(t0, 1);
        assert!(!channel.is_due(t0 + Duration::from_millis(39)));
        assert!(channel.is_due(t0 + Duration::from_millis(40)));
        assert_eq!(channel.last_frame_at(), Some(t0));
    }

    #[test]
    fn test_disconnected_source_yields_fallback() {
        let mut channel = state(false, Some(Frame::filled(8, 8, [9, 9, 9])));

        let produced = channel.produce(Instant::now(), 7);
        assert_eq!(produced.origin, FrameOrigin::Fallback);
        assert_eq!(produced.frame, synthesize(SyntheticKind::ConnectionLost, 7));
        assert!(channel.is_failed());
        assert!(!channel.is_active());
    }

    #[test]
    fn test_empty_source_yields_fallback() {
        let mut channel = state(true, None);

        let produced = channel.produce(Instant::now(), 1);
        assert_eq!(produced.origin, FrameOrigin::Fallback);
        assert!(channel.is_failed());
        assert!(channel.is_active());
    }

    #[test]
    fn test_output_size_applies_to_source_frames() {
        let config = ChannelConfig::monitoring("http://cam");
        let source = MockSource::new("monitoring", true, Some(Frame::filled(640, 480, [1, 2, 3])));
        let mut channel = ChannelState::new(config, Box::new(source));

        let produced = channel.produce(Instant::now(), 1);
        assert_eq!(produced.origin, FrameOrigin::Source);
        assert_eq!((produced.frame.width, produced.frame.height), (320, 240));
        assert!(!channel.is_failed());
    }

    #[test]
    fn test_prepare_reuses_unchanged_frame() {
        let mut channel = state(true, Some(Frame::filled(16, 16, [100, 100, 100])));

        let first = channel.produce(Instant::now(), 1);
        let encoded = channel.prepare(first).unwrap();
        assert!(!encoded.reused);

        let second = channel.produce(Instant::now(), 2);
        let reused = channel.prepare(second).unwrap();
        assert!(reused.reused);
        assert_eq!(reused.payload, encoded.payload);
    }

    #[test]
    fn test_prepare_replaces_cache_together() {
        let mut channel = state(true, None);
        let dark = ProducedFrame {
            frame: Frame::filled(16, 16, [0, 0, 0]),
            origin: FrameOrigin::Source,
        };
        let bright = ProducedFrame {
            frame: Frame::filled(16, 16, [200, 200, 200]),
            origin: FrameOrigin::Source,
        };

        let a = channel.prepare(dark).unwrap();
        let b = channel.prepare(bright.clone()).unwrap();
        assert!(!b.reused);
        assert_ne!(a.payload, b.payload);

        let cached = channel.cached().unwrap();
        assert_eq!(cached.frame, bright.frame);
        assert_eq!(cached.payload, b.payload);
    }

    #[test]
    fn test_origin_switch_forces_encode() {
        let mut channel = state(true, None);
        let frame = Frame::filled(16, 16, [0, 0, 0]);

        channel
            .prepare(ProducedFrame {
                frame: frame.clone(),
                origin: FrameOrigin::Source,
            })
            .unwrap();
        let fallback = channel
            .prepare(ProducedFrame {
                frame,
                origin: FrameOrigin::Fallback,
            })
            .unwrap();

        assert!(!fallback.reused);
        assert_eq!(channel.cached().unwrap().origin, FrameOrigin::Fallback);
    }

    #[test]
    fn test_encode_failure_keeps_cache() {
        let mut channel = state(true, None);
        let good = channel
            .prepare(ProducedFrame {
                frame: Frame::filled(8, 8, [5, 5, 5]),
                origin: FrameOrigin::Source,
            })
            .unwrap();

        let broken = ProducedFrame {
            frame: Frame::new(4, 4, PixelFormat::Rgb8, vec![0; 3]),
            origin: FrameOrigin::Source,
        };
        assert!(channel.prepare(broken).is_err());
        assert_eq!(channel.cached().unwrap().payload, good.payload);
    }

    #[test]
    fn test_check_connection() {
        let source = MockSource::new("cam", false, None);
        let (connected, reconnects) = (Arc::clone(&source.connected), Arc::clone(&source.reconnects));
        let mut channel = ChannelState::new(ChannelConfig::monitoring("http://cam"), Box::new(source));

        assert!(channel.check_connection());
        assert!(channel.check_connection());
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);

        connected.store(true, Ordering::SeqCst);
        assert!(!channel.check_connection());
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_check_connection_without_capability() {
        let config = ChannelConfig::basler().source(SourceConfig::LocalDevice { index: 0 });
        let mut channel = ChannelState::new(config, Box::new(LocalSource::disconnected("basler".into(), 0)));

        assert!(!channel.is_connected());
        assert!(channel.is_active());
        assert!(!channel.check_connection());
    }

    #[test]
    fn test_failed_device_shows_connection_lost() {
        let config = ChannelConfig::basler().source(SourceConfig::LocalDevice { index: 0 });
        let mut channel = ChannelState::new(config, Box::new(LocalSource::disconnected("basler".into(), 0)));

        let produced = channel.produce(Instant::now(), 4);

        assert_eq!(produced.origin, FrameOrigin::Fallback);
        assert_eq!(produced.frame, synthesize(SyntheticKind::ConnectionLost, 4));
        assert_ne!(produced.frame, synthesize(SyntheticKind::TestPattern, 4));
    }
}
