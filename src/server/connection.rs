//! Per-viewer WebSocket connection
//!
//! The socket is split in two: a writer task drains the viewer's bounded
//! queue into the sink, while the reader loop answers control messages.
//! Control replies go through the same queue, so the scheduler and the
//! reader never touch the socket directly.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::viewer::{Viewer, ViewerId, ViewerState, ViewerStatus};
use crate::error::Result;
use crate::protocol::respond;
use crate::scheduler::ViewerEvent;

/// One accepted viewer connection
pub struct Connection {
    id: ViewerId,
    peer_addr: SocketAddr,
    queue_depth: usize,
    events: mpsc::UnboundedSender<ViewerEvent>,
}

impl Connection {
    pub fn new(
        id: ViewerId,
        peer_addr: SocketAddr,
        queue_depth: usize,
        events: mpsc::UnboundedSender<ViewerEvent>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            queue_depth,
            events,
        }
    }

    /// Perform the WebSocket handshake and serve the viewer until it leaves
    pub async fn run(self, socket: TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(socket).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut queue) = mpsc::channel::<Message>(self.queue_depth);
        let status = ViewerStatus::new();
        let viewer = Viewer::new(self.id, self.peer_addr, status.clone(), outbound.clone());

        if self.events.send(ViewerEvent::Connected(viewer)).is_err() {
            tracing::warn!(viewer_id = self.id, "Scheduler gone, closing viewer");
            let _ = sink.close().await;
            return Ok(());
        }

        let writer_status = status.clone();
        let viewer_id = self.id;
        let mut writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(viewer_id, error = %e, "Send failed");
                    break;
                }
            }
            writer_status.set(ViewerState::Closed);
            let _ = sink.close().await;
        });

        let result: Result<()> = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let reply = respond(text.as_str());
                        if outbound.send(Message::text(reply)).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    // Pings are answered by the protocol layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                _ = &mut writer => break Ok(()),
            }
        };

        status.set(ViewerState::Closing);
        let _ = self.events.send(ViewerEvent::Disconnected(self.id));
        drop(outbound);
        writer.abort();
        status.set(ViewerState::Closed);

        result
    }
}
