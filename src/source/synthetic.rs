//! Procedural frame generator
//!
//! [`synthesize`] is a pure function of the frame kind and a frame counter:
//! the same inputs always render the same pixels. It backs both permanent
//! simulated feeds and the "connection lost" placeholder shown while a real
//! source is down.

use super::CameraSource;
use crate::frame::{ChannelId, Frame, PixelFormat};

/// Size of the simulated camera test pattern
pub const TEST_PATTERN_SIZE: (u32, u32) = (640, 480);

/// Size of the connection-lost placeholder
pub const CONNECTION_LOST_SIZE: (u32, u32) = (320, 240);

/// What a synthetic frame depicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    /// Animated test pattern of a simulated industrial camera
    TestPattern,
    /// Noisy "lost connection, reconnecting" placeholder
    ConnectionLost,
    /// Plain black frame
    Blank,
}

/// Render a synthetic frame
pub fn synthesize(kind: SyntheticKind, counter: u64) -> Frame {
    match kind {
        SyntheticKind::TestPattern => test_pattern(counter),
        SyntheticKind::ConnectionLost => connection_lost(counter),
        SyntheticKind::Blank => {
            let (w, h) = CONNECTION_LOST_SIZE;
            Frame::filled(w, h, [0, 0, 0])
        }
    }
}

fn test_pattern(counter: u64) -> Frame {
    let (w, h) = TEST_PATTERN_SIZE;
    let mut canvas = Canvas::new(w, h);
    let phase = counter as f32 * 0.05;

    // Gradient background. Trig terms are separable per row and column:
    // b uses sin(a + c) = sin(a)cos(c) + cos(a)sin(c).
    let cols: Vec<(f32, f32, f32)> = (0..w)
        .map(|x| {
            let nx = x as f32 / w as f32;
            let a = phase * 1.2 + nx * 1.8;
            ((phase + nx * 2.0).sin(), a.sin(), a.cos())
        })
        .collect();

    for y in 0..h {
        let ny = y as f32 / h as f32;
        let row_cos = (ny * 1.5).cos();
        let g = (100.0 + 40.0 * (phase * 0.8 + ny * 2.0).cos()) as i32;
        let (c_sin, c_cos) = ((ny * 1.8).sin(), (ny * 1.8).cos());

        for (x, &(r_sin, a_sin, a_cos)) in cols.iter().enumerate() {
            let r = (120.0 + 60.0 * r_sin * row_cos) as i32;
            let b = (80.0 + 50.0 * (a_sin * c_cos + a_cos * c_sin)) as i32;
            canvas.put(
                x as i32,
                y as i32,
                [r.clamp(50, 200) as u8, g.clamp(40, 180) as u8, b.clamp(30, 160) as u8],
            );
        }
    }

    let (wi, hi) = (w as i32, h as i32);

    // Header bar with a frame progress indicator
    canvas.fill_rect(0, 0, wi, 60, [20, 20, 20]);
    let progress = (counter % 120) as i32 * 4;
    canvas.fill_rect(20, 40, 20 + progress, 46, [150, 150, 150]);

    // Crosshair, breathing with the phase
    let (cx, cy) = (wi / 2, hi / 2);
    let cross = 30 + (10.0 * (phase * 2.0).sin()) as i32;
    canvas.fill_rect(cx - cross, cy - 1, cx + cross + 1, cy + 1, [0, 255, 0]);
    canvas.fill_rect(cx - 1, cy - cross, cx + 1, cy + cross + 1, [0, 255, 0]);

    // Orbiting marker
    let ox = cx + (80.0 * phase.cos()) as i32;
    let oy = cy + (80.0 * phase.sin()) as i32;
    canvas.fill_circle(ox, oy, 15, [0, 100, 255]);
    canvas.ring(ox, oy, 20, 2, [255, 255, 255]);

    // Measurement grid
    for x in (80..wi).step_by(80) {
        canvas.fill_rect(x, 60, x + 1, hi, [80, 80, 80]);
    }
    for y in (80..hi).step_by(80) {
        canvas.fill_rect(0, y, wi, y + 1, [80, 80, 80]);
    }

    // Status panel with an "active" lamp
    canvas.fill_rect(wi - 150, 70, wi - 10, 120, [40, 40, 40]);
    canvas.fill_rect(wi - 140, 84, wi - 128, 96, [0, 255, 0]);

    canvas.into_frame()
}

fn connection_lost(counter: u64) -> Frame {
    let (w, h) = CONNECTION_LOST_SIZE;
    let mut canvas = Canvas::new(w, h);
    let mut rng = NoiseRng::new(counter);

    // Dark background blended 80/20 with uniform noise in [0, 50)
    let background = [40.0f32, 30.0, 30.0];
    for px in canvas.data.chunks_exact_mut(3) {
        for (value, bg) in px.iter_mut().zip(background) {
            let noise = (rng.next() % 50) as f32;
            *value = (bg * 0.8 + noise * 0.2).round() as u8;
        }
    }

    // Warning banner and "reconnecting" line
    canvas.fill_rect(20, 92, 300, 104, [255, 100, 0]);
    canvas.fill_rect(30, 124, 260, 130, [200, 200, 200]);

    // Animated "connecting..." dots
    let dots = ((counter / 10) % 4) as i32 + 1;
    for i in 0..dots {
        let x = 60 + i * 14;
        canvas.fill_rect(x, 154, x + 8, 162, [0, 255, 255]);
    }

    // Pulsing indicator
    let pulse = (100.0 + 100.0 * (counter as f32 * 0.2).sin()) as i32;
    canvas.fill_circle(160, 200, 8, [255, pulse.clamp(0, 255) as u8, 0]);

    canvas.into_frame()
}

/// Deterministic noise generator (splitmix64)
struct NoiseRng(u64);

impl NoiseRng {
    fn new(seed: u64) -> Self {
        Self(seed ^ 0x9E37_79B9_7F4A_7C15)
    }

    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Minimal RGB drawing surface; all primitives clip to the frame
struct Canvas {
    width: i32,
    height: i32,
    data: Vec<u8>,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as i32,
            height: height as i32,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    fn put(&mut self, x: i32, y: i32, rgb: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Fill `[x0, x1) x [y0, y1)`
    fn fill_rect(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, rgb: [u8; 3]) {
        for y in y0.max(0)..y1.min(self.height) {
            for x in x0.max(0)..x1.min(self.width) {
                self.put(x, y, rgb);
            }
        }
    }

    fn fill_circle(&mut self, cx: i32, cy: i32, r: i32, rgb: [u8; 3]) {
        for y in cy - r..=cy + r {
            for x in cx - r..=cx + r {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= r * r {
                    self.put(x, y, rgb);
                }
            }
        }
    }

    fn ring(&mut self, cx: i32, cy: i32, r: i32, thickness: i32, rgb: [u8; 3]) {
        let inner = (r - thickness / 2).max(0);
        let outer = r + (thickness + 1) / 2;
        for y in cy - outer..=cy + outer {
            for x in cx - outer..=cx + outer {
                let d2 = (x - cx) * (x - cx) + (y - cy) * (y - cy);
                if d2 >= inner * inner && d2 <= outer * outer {
                    self.put(x, y, rgb);
                }
            }
        }
    }

    fn into_frame(self) -> Frame {
        Frame::new(self.width as u32, self.height as u32, PixelFormat::Rgb8, self.data)
    }
}

/// A permanent simulated feed with no backing device
#[derive(Debug)]
pub struct SyntheticSource {
    channel: ChannelId,
    kind: SyntheticKind,
    counter: u64,
}

impl SyntheticSource {
    /// Create a synthetic feed for a channel
    pub fn new(channel: ChannelId, kind: SyntheticKind) -> Self {
        Self {
            channel,
            kind,
            counter: 0,
        }
    }

    /// Frames rendered so far
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl CameraSource for SyntheticSource {
    fn is_connected(&self) -> bool {
        true
    }

    fn grab_frame(&mut self) -> Option<Frame> {
        self.counter += 1;
        Some(synthesize(self.kind, self.counter))
    }

    fn channel(&self) -> &ChannelId {
        &self.channel
    }
}
