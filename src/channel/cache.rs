//! Per-channel frame cache and change detection

use crate::frame::{EncodedPayload, Frame};

/// Largest possible difference magnitude for a frame format
///
/// The magnitude is a sum of per-channel means of `|a - b|`, each in `0..=255`.
pub fn max_magnitude(channels: usize) -> f64 {
    255.0 * channels as f64
}

/// Sum over color channels of the mean absolute pixel difference
///
/// Both frames must share geometry; returns `None` otherwise.
pub fn difference_magnitude(a: &Frame, b: &Frame) -> Option<f64> {
    if !a.same_geometry(b) || a.data.len() != b.data.len() || a.data.len() != a.expected_len() {
        return None;
    }

    let channels = a.format.channels();
    let pixels = (a.width as usize) * (a.height as usize);
    if pixels == 0 {
        return Some(0.0);
    }

    let mut sums = [0u64; 4];
    for (pa, pb) in a.data.chunks_exact(channels).zip(b.data.chunks_exact(channels)) {
        for c in 0..channels {
            sums[c] += pa[c].abs_diff(pb[c]) as u64;
        }
    }

    Some(sums[..channels].iter().map(|&sum| sum as f64 / pixels as f64).sum())
}

/// Whether `frame` differs enough from `cached` to be worth re-encoding
///
/// True when nothing is cached, when geometry or format differ, or when the
/// difference magnitude is strictly greater than `threshold`.
pub fn has_changed(frame: &Frame, cached: Option<&Frame>, threshold: f64) -> bool {
    match cached {
        None => true,
        Some(cached) => match difference_magnitude(frame, cached) {
            Some(magnitude) => magnitude > threshold,
            None => true,
        },
    }
}

/// Where a channel's frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// The channel's camera source
    Source,
    /// The synthetic fallback, while the source is down
    Fallback,
}

/// Last encoded frame of a channel
///
/// The raw frame and its payload are only ever replaced together.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    /// Raw frame that was encoded
    pub frame: Frame,
    /// Its encoding
    pub payload: EncodedPayload,
    /// Where the raw frame came from
    pub origin: FrameOrigin,
}
