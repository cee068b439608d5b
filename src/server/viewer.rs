//! Viewer handles and the live-viewer set
//!
//! A [`Viewer`] is owned by the scheduler; the connection task keeps only a
//! [`ViewerStatus`] handle to publish state changes. Delivery goes through a
//! bounded queue drained by the connection's writer task, so broadcasting
//! never waits on a socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;

/// Viewer identifier, unique per listener
pub type ViewerId = u64;

/// Connection state of a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ViewerState {
    /// Open and accepting frames
    Connected = 0,
    /// Close started, no more frames
    Closing = 1,
    /// Gone
    Closed = 2,
}

impl ViewerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ViewerState::Connected,
            1 => ViewerState::Closing,
            _ => ViewerState::Closed,
        }
    }
}

/// Shared, lock-free view of a viewer's state
#[derive(Debug, Clone)]
pub struct ViewerStatus(Arc<AtomicU8>);

impl ViewerStatus {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ViewerState::Connected as u8)))
    }

    pub fn get(&self) -> ViewerState {
        ViewerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `state`; states never go back towards `Connected`
    pub fn set(&self, state: ViewerState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

impl Default for ViewerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected client
#[derive(Debug)]
pub struct Viewer {
    id: ViewerId,
    peer: SocketAddr,
    status: ViewerStatus,
    outbound: mpsc::Sender<Message>,
}

impl Viewer {
    pub fn new(id: ViewerId, peer: SocketAddr, status: ViewerStatus, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            peer,
            status,
            outbound,
        }
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ViewerState {
        self.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ViewerState::Connected
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Messages queued
    pub delivered: usize,
    /// Messages dropped on a full queue
    pub dropped: usize,
    /// Viewers skipped because they are not connected
    pub skipped: usize,
}

/// The set of live viewers
#[derive(Debug, Default)]
pub struct ViewerSet {
    viewers: HashMap<ViewerId, Viewer>,
}

impl ViewerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer
    pub fn insert(&mut self, viewer: Viewer) {
        self.viewers.insert(viewer.id(), viewer);
    }

    /// Remove a viewer, returning it if it was present
    pub fn remove(&mut self, id: ViewerId) -> Option<Viewer> {
        self.viewers.remove(&id)
    }

    /// Number of registered viewers, connected or not
    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    /// Number of viewers in the connected state
    pub fn connected_count(&self) -> usize {
        self.viewers.values().filter(|v| v.is_connected()).count()
    }

    #[cfg(test)]
    pub fn contains(&self, id: ViewerId) -> bool {
        self.viewers.contains_key(&id)
    }

    /// Queue a message to every connected viewer without waiting
    ///
    /// A full queue drops the message for that viewer only. A viewer whose
    /// queue is closed is marked closed and left for [`sweep`](Self::sweep).
    pub fn broadcast(&self, message: &Message) -> SendReport {
        let mut report = SendReport::default();

        for viewer in self.viewers.values() {
            if !viewer.is_connected() {
                report.skipped += 1;
                continue;
            }

            match viewer.outbound.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(viewer_id = viewer.id, "Viewer queue full, frame dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    viewer.status.set(ViewerState::Closed);
                    report.skipped += 1;
                }
            }
        }

        if report.delivered == 0 && report.dropped == 0 && report.skipped > 0 {
            tracing::debug!(viewers = self.viewers.len(), "No connected viewer to send to");
        }

        report
    }

    /// Remove every viewer that is no longer connected
    ///
    /// Returns the number removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.viewers.len();
        self.viewers.retain(|_, viewer| viewer.is_connected() && !viewer.outbound.is_closed());
        before - self.viewers.len()
    }
}
