//! Single-slot latest-frame mailbox
//!
//! The only mutable state shared between a capture thread and the scheduler.
//! A publish overwrites whatever is in the slot; there is no queue, so a slow
//! reader sees the newest frame and intermediate frames are dropped.
//!
//! The lock is held only for the swap on publish and the copy on read, never
//! across I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::Frame;

#[derive(Debug, Default)]
struct Slot {
    frame: Option<Frame>,
    unread: bool,
}

/// Latest-wins single frame slot
#[derive(Debug, Default)]
pub struct FrameMailbox {
    slot: Mutex<Slot>,
    published: AtomicU64,
    overwritten: AtomicU64,
}

impl FrameMailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A panicking writer cannot leave a half-written frame behind,
        // so a poisoned slot is still usable.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a frame, replacing whatever is in the slot
    pub fn publish(&self, frame: Frame) {
        let replaced_unread = {
            let mut slot = self.slot();
            let unread = slot.unread;
            slot.frame = Some(frame);
            slot.unread = true;
            unread
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        if replaced_unread {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy out the newest frame, leaving it in place
    pub fn latest(&self) -> Option<Frame> {
        let mut slot = self.slot();
        slot.unread = false;
        slot.frame.clone()
    }

    /// Drop any frame in the slot
    pub fn clear(&self) {
        *self.slot() = Slot::default();
    }

    /// Total frames published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames replaced before any reader saw them
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
