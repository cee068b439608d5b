//! Frame scheduler
//!
//! One task owns every [`ChannelState`], the [`ViewerSet`] and the
//! throughput counters. A single periodic tick drives all of it:
//!
//! ```text
//!            first viewer connects
//!   ┌──────┐ ─────────────────────► ┌────────┐
//!   │ Idle │                        │ Active │ ◄── tick every 5ms
//!   └──────┘ ◄───────────────────── └────────┘
//!      last viewer gone, or no channel active
//! ```
//!
//! Each tick reads the clock once and compares it against every channel's
//! own interval, so cadences never drift against each other. Coarser work
//! (reconnect checks, statistics, viewer sweep) runs on sub-periods of the
//! same tick. While idle the timer is dropped entirely.

pub mod config;

pub use config::SchedulerConfig;

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{ChannelConfig, ChannelState, FrameOrigin};
use crate::frame::ChannelId;
use crate::protocol::frame_message;
use crate::server::viewer::{Viewer, ViewerId, ViewerSet};
use crate::source::NetworkSourceConfig;
use crate::stats::ThroughputStats;

/// Viewer lifecycle notifications from connection tasks
#[derive(Debug)]
pub enum ViewerEvent {
    /// Handshake completed
    Connected(Viewer),
    /// Connection closed
    Disconnected(ViewerId),
}

/// Whether the tick timer is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Timer stopped
    Idle,
    /// Timer running
    Active,
}

/// A sub-period of the tick
#[derive(Debug)]
struct Periodic {
    period: Duration,
    last: Option<Instant>,
}

impl Periodic {
    fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// The first call only starts the period
    fn due(&mut self, now: Instant) -> bool {
        match self.last {
            None => {
                self.last = Some(now);
                false
            }
            Some(last) if now.saturating_duration_since(last) >= self.period => {
                self.last = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}

/// The frame scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    channels: Vec<ChannelState>,
    viewers: ViewerSet,
    state: SchedulerState,
    stats: ThroughputStats,
    frame_counter: u64,
    capture_dropped_total: u64,
    connection_check: Periodic,
    stats_report: Periodic,
    cleanup: Periodic,
}

impl Scheduler {
    /// Create an idle scheduler over already opened channels
    pub fn new(config: SchedulerConfig, channels: Vec<ChannelState>) -> Self {
        Self {
            connection_check: Periodic::new(config.connection_check_interval),
            stats_report: Periodic::new(config.stats_interval),
            cleanup: Periodic::new(config.cleanup_interval),
            config,
            channels,
            viewers: ViewerSet::new(),
            state: SchedulerState::Idle,
            stats: ThroughputStats::new(Instant::now()),
            frame_counter: 0,
            capture_dropped_total: 0,
        }
    }

    /// Open every channel's source and create the scheduler
    pub fn with_channels(config: SchedulerConfig, channels: Vec<ChannelConfig>, network: &NetworkSourceConfig) -> Self {
        let channels = channels
            .into_iter()
            .map(|channel| {
                let source = channel.open_source(network);
                tracing::info!(
                    channel = %channel.id,
                    interval_ms = channel.interval.as_millis() as u64,
                    quality = %channel.quality,
                    connected = source.is_connected(),
                    "Channel registered"
                );
                ChannelState::new(channel, source)
            })
            .collect();
        Self::new(config, channels)
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn viewers(&self) -> &ViewerSet {
        &self.viewers
    }

    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    /// Look up a channel by id
    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelState> {
        self.channels.iter().find(|c| c.id() == id)
    }

    /// Counters of the current statistics window
    pub fn stats(&self) -> &ThroughputStats {
        &self.stats
    }

    /// Ticks performed since creation
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Apply a viewer lifecycle event
    pub fn handle_event(&mut self, event: ViewerEvent) {
        match event {
            ViewerEvent::Connected(viewer) => {
                tracing::info!(
                    viewer_id = viewer.id(),
                    peer = %viewer.peer(),
                    viewers = self.viewers.len() + 1,
                    "Viewer connected"
                );
                self.viewers.insert(viewer);
                if self.state == SchedulerState::Idle {
                    self.state = SchedulerState::Active;
                    tracing::info!("Scheduler active");
                }
            }
            ViewerEvent::Disconnected(id) => {
                if self.viewers.remove(id).is_some() {
                    tracing::info!(viewer_id = id, viewers = self.viewers.len(), "Viewer disconnected");
                }
                if self.viewers.is_empty() {
                    self.go_idle("last viewer disconnected");
                }
            }
        }
    }

    /// Run one scheduling step at `now`
    pub fn tick(&mut self, now: Instant) {
        self.frame_counter += 1;
        self.stats.ticks += 1;

        let mut any_active = false;
        for channel in &mut self.channels {
            if channel.is_active() {
                any_active = true;
            }
            if !channel.is_due(now) {
                continue;
            }

            let produced = channel.produce(now, self.frame_counter);
            self.stats.frames_processed += 1;
            if produced.origin == FrameOrigin::Fallback {
                self.stats.fallback_frames += 1;
            }

            if self.viewers.is_empty() {
                continue;
            }

            match channel.prepare(produced) {
                Ok(prepared) => {
                    if prepared.reused {
                        self.stats.cache_reuses += 1;
                    } else {
                        self.stats.encodes += 1;
                        self.stats.bytes_encoded += prepared.payload.len() as u64;
                    }

                    let message = Message::text(frame_message(&prepared.payload));
                    let report = self.viewers.broadcast(&message);
                    self.stats.messages_delivered += report.delivered as u64;
                    self.stats.messages_dropped += report.dropped as u64;

                    tracing::trace!(
                        channel = %channel.id(),
                        bytes = prepared.payload.len(),
                        reused = prepared.reused,
                        delivered = report.delivered,
                        "Frame sent"
                    );
                }
                Err(e) => {
                    self.stats.encode_failures += 1;
                    tracing::warn!(channel = %channel.id(), error = %e, "Frame encode failed, skipping");
                }
            }
        }

        if self.connection_check.due(now) {
            for channel in &mut self.channels {
                channel.check_connection();
            }
        }

        if self.stats_report.due(now) {
            let capture_dropped: u64 = self.channels.iter().map(|c| c.frames_dropped()).sum();
            self.stats.capture_dropped = capture_dropped.saturating_sub(self.capture_dropped_total);
            self.capture_dropped_total = capture_dropped;
            self.stats.report_and_reset(now, self.viewers.connected_count());
        }

        if self.cleanup.due(now) {
            let removed = self.viewers.sweep();
            tracing::debug!(removed, viewers = self.viewers.len(), "Viewer cleanup");
        }

        if self.viewers.is_empty() {
            self.go_idle("no viewers");
        } else if !any_active {
            self.go_idle("no active channels");
        }
    }

    fn go_idle(&mut self, reason: &str) {
        if self.state == SchedulerState::Active {
            self.state = SchedulerState::Idle;
            tracing::info!(reason, "Scheduler idle");
        }
    }

    /// Run until every event sender is dropped
    pub async fn run(self, events: mpsc::UnboundedReceiver<ViewerEvent>) -> Self {
        self.run_until(events, std::future::pending()).await
    }

    /// Run until `shutdown` completes or every event sender is dropped
    ///
    /// Returns the scheduler so its sources can be released off the runtime.
    pub async fn run_until<F>(mut self, mut events: mpsc::UnboundedReceiver<ViewerEvent>, shutdown: F) -> Self
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker: Option<Interval> = None;

        loop {
            match self.state {
                SchedulerState::Idle => ticker = None,
                SchedulerState::Active if ticker.is_none() => {
                    let mut interval = tokio::time::interval(self.config.tick_interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker = Some(interval);
                }
                SchedulerState::Active => {}
            }

            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = next_tick(&mut ticker) => {
                    self.tick(tokio::time::Instant::now().into_std());
                }
            }
        }

        tracing::debug!(ticks = self.frame_counter, "Scheduler stopped");
        self
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("channels", &self.channels)
            .field("viewers", &self.viewers.len())
            .field("frame_counter", &self.frame_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;

    use super::*;
    use crate::channel::tests::MockSource;
    use crate::channel::SourceConfig;
    use crate::encoder::{self, QualityProfile};
    use crate::frame::Frame;
    use crate::server::viewer::{ViewerState, ViewerStatus};
    use crate::source::{synthesize, SyntheticKind};

    fn channel(name: &str, interval_ms: u64, source: MockSource) -> ChannelState {
        let config = ChannelConfig::new(name, SourceConfig::Network { url: format!("http://{name}") })
            .interval(Duration::from_millis(interval_ms))
            .change_threshold(10.0);
        ChannelState::new(config, Box::new(source))
    }

    fn always_on(name: &str, interval_ms: u64) -> ChannelState {
        let source = MockSource::new(name, true, Some(Frame::filled(16, 16, [90, 90, 90])));
        let config = ChannelConfig::new(name, SourceConfig::Synthetic(SyntheticKind::TestPattern))
            .interval(Duration::from_millis(interval_ms));
        ChannelState::new(config, Box::new(source))
    }

    fn viewer(id: ViewerId) -> (Viewer, ViewerStatus, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let status = ViewerStatus::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (Viewer::new(id, peer, status.clone(), tx), status, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message.into_text().unwrap().as_str().to_owned());
        }
        out
    }

    fn tags(messages: &[String]) -> Vec<&str> {
        messages.iter().map(|m| m.split(':').next().unwrap()).collect()
    }

    #[test]
    fn test_starts_idle() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.frame_counter(), 0);
    }

    #[test]
    fn test_connect_activates_and_serves_due_channels() {
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            vec![
                channel("monitoring", 40, MockSource::new("monitoring", true, Some(Frame::filled(16, 16, [1, 1, 1])))),
                always_on("basler", 50),
            ],
        );
        let (v, _, mut rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));
        assert_eq!(scheduler.state(), SchedulerState::Active);

        let t0 = Instant::now();
        scheduler.tick(t0);
        assert_eq!(tags(&drain(&mut rx)), vec!["monitoring", "basler"]);
        assert_eq!(scheduler.stats().frames_processed, 2);

        // Nothing is due one tick later
        scheduler.tick(t0 + Duration::from_millis(5));
        assert!(drain(&mut rx).is_empty());

        scheduler.tick(t0 + Duration::from_millis(40));
        assert_eq!(tags(&drain(&mut rx)), vec!["monitoring"]);
        scheduler.tick(t0 + Duration::from_millis(50));
        assert_eq!(tags(&drain(&mut rx)), vec!["basler"]);
        assert_eq!(scheduler.stats().frames_processed, 4);
    }

    #[test]
    fn test_unchanged_frames_reuse_payload() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (v, _, mut rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));

        let t0 = Instant::now();
        scheduler.tick(t0);
        scheduler.tick(t0 + Duration::from_millis(50));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], messages[1]);
        assert_eq!(scheduler.stats().encodes, 1);
        assert_eq!(scheduler.stats().cache_reuses, 1);
    }

    #[test]
    fn test_disconnected_source_sends_fallback() {
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            vec![
                channel("monitoring", 40, MockSource::new("monitoring", false, Some(Frame::filled(16, 16, [1, 1, 1])))),
                always_on("basler", 50),
            ],
        );
        let (v, _, mut rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));
        scheduler.tick(Instant::now());

        let messages = drain(&mut rx);
        let monitoring = messages.iter().find(|m| m.starts_with("monitoring:")).unwrap();

        // Exactly the encoding of the placeholder for this tick, not the stale source frame
        let expected = encoder::encode(
            &synthesize(SyntheticKind::ConnectionLost, 1),
            &ChannelId::new("monitoring"),
            QualityProfile::High,
        )
        .unwrap();
        assert_eq!(monitoring, &frame_message(&expected));

        let state = scheduler.channel(&ChannelId::new("monitoring")).unwrap();
        assert!(state.is_failed());
        assert_eq!(state.cached().unwrap().origin, FrameOrigin::Fallback);
        assert_eq!(scheduler.stats().fallback_frames, 1);
    }

    #[test]
    fn test_delivered_payload_decodes() {
        let source = MockSource::new("monitoring", true, Some(synthesize(SyntheticKind::TestPattern, 5)));
        let config = ChannelConfig::monitoring("http://cam");
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            vec![ChannelState::new(config, Box::new(source)), always_on("basler", 50)],
        );
        let (v, _, mut rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));
        scheduler.tick(Instant::now());

        let messages = drain(&mut rx);
        let body = messages[0].strip_prefix("monitoring:").unwrap();
        let jpeg = STANDARD_NO_PAD.decode(body).unwrap();
        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8();

        // Resized to the channel's output size; header bar stays dark
        assert_eq!(decoded.dimensions(), (320, 240));
        let px = decoded.get_pixel(10, 5).0;
        assert!(px.iter().all(|&c| c < 60), "{px:?}");
    }

    #[test]
    fn test_never_connected_source_keeps_reconnecting() {
        let source = MockSource::new("monitoring", false, None);
        let reconnects = Arc::clone(&source.reconnects);
        let config = SchedulerConfig::default().stats_interval(Duration::from_secs(3600));
        let mut scheduler = Scheduler::new(config, vec![channel("monitoring", 40, source), always_on("basler", 50)]);
        let (v, _, mut rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));

        let t0 = Instant::now();
        for step in 0..=15u64 {
            scheduler.tick(t0 + Duration::from_secs(step));
        }

        // First tick starts the period, then one request every 5s
        assert_eq!(reconnects.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), SchedulerState::Active);

        let messages = drain(&mut rx);
        let fallback = messages.iter().filter(|m| m.starts_with("monitoring:")).count();
        assert_eq!(fallback, 16);
        assert_eq!(scheduler.stats().fallback_frames, 16);
    }

    #[test]
    fn test_idle_when_no_channel_active() {
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            vec![channel("monitoring", 40, MockSource::new("monitoring", false, None))],
        );
        let (v, _, _rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));
        scheduler.tick(Instant::now());

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        // The viewer stays registered; a new connection restarts the timer
        assert_eq!(scheduler.viewers().len(), 1);
        let (v2, _, _rx2) = viewer(2);
        scheduler.handle_event(ViewerEvent::Connected(v2));
        assert_eq!(scheduler.state(), SchedulerState::Active);
    }

    #[test]
    fn test_last_disconnect_goes_idle() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (a, _, _rx_a) = viewer(1);
        let (b, _, _rx_b) = viewer(2);
        scheduler.handle_event(ViewerEvent::Connected(a));
        scheduler.handle_event(ViewerEvent::Connected(b));

        scheduler.handle_event(ViewerEvent::Disconnected(1));
        assert_eq!(scheduler.state(), SchedulerState::Active);
        scheduler.handle_event(ViewerEvent::Disconnected(2));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.viewers().is_empty());
    }

    #[test]
    fn test_stats_window_tracks_capture_drops() {
        let source = MockSource::new("monitoring", true, Some(Frame::filled(16, 16, [1, 1, 1])));
        let dropped = Arc::clone(&source.dropped);
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![channel("monitoring", 40, source)]);

        let t0 = Instant::now();
        scheduler.tick(t0);
        dropped.store(7, Ordering::SeqCst);
        scheduler.tick(t0 + Duration::from_secs(10));
        assert_eq!(scheduler.capture_dropped_total, 7);
        assert_eq!(scheduler.stats().capture_dropped, 0);

        dropped.store(9, Ordering::SeqCst);
        scheduler.tick(t0 + Duration::from_secs(20));
        assert_eq!(scheduler.capture_dropped_total, 9);
    }

    #[test]
    fn test_no_encode_without_viewers() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        scheduler.tick(Instant::now());

        assert_eq!(scheduler.stats().frames_processed, 1);
        assert_eq!(scheduler.stats().encodes, 0);
        assert_eq!(scheduler.stats().messages_delivered, 0);
    }

    #[test]
    fn test_sweep_removes_stale_viewers() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (v, status, _rx) = viewer(1);
        scheduler.handle_event(ViewerEvent::Connected(v));

        let t0 = Instant::now();
        scheduler.tick(t0);
        status.set(ViewerState::Closed);

        scheduler.tick(t0 + Duration::from_secs(10));
        assert_eq!(scheduler.viewers().len(), 1);

        scheduler.tick(t0 + Duration::from_secs(30));
        assert!(scheduler.viewers().is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_consumes_no_ticks() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(tx);

        let scheduler = handle.await.unwrap();
        assert_eq!(scheduler.frame_counter(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_active_then_idle() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scheduler.run(rx));

        let (v, _, mut frames) = viewer(1);
        tx.send(ViewerEvent::Connected(v)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(ViewerEvent::Disconnected(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The viewer's queue closes once the scheduler drops it
        let mut received = 0;
        while frames.recv().await.is_some() {
            received += 1;
        }
        assert!((2..=3).contains(&received), "received {received}");

        drop(tx);
        let scheduler = handle.await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        // About 100ms of 5ms ticks, none during the idle second
        assert!((15..=25).contains(&scheduler.frame_counter()), "{}", scheduler.frame_counter());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), vec![always_on("basler", 50)]);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(scheduler.run_until(rx, async {
            let _ = stop_rx.await;
        }));
        stop_tx.send(()).unwrap();

        let scheduler = handle.await.unwrap();
        assert_eq!(scheduler.frame_counter(), 0);
    }
}
