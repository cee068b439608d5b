//! Broadcast server listener
//!
//! Handles the TCP accept loop, spawns a task per viewer and runs the
//! scheduler alongside them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::error::Result;
use crate::scheduler::{Scheduler, ViewerEvent};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::stats::ServerStats;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
}

/// Releases the active-connection count when the viewer task ends
struct ActiveGuard(Arc<Counters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// WebSocket server delivering channel frames to viewers
pub struct BroadcastServer {
    config: ServerConfig,
    next_viewer_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

impl BroadcastServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            next_viewer_id: AtomicU64::new(1),
            connection_semaphore,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Snapshot of the connection counters
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve until `shutdown` completes
    ///
    /// A bind failure is logged and not returned: the process keeps running
    /// without video delivery until shutdown.
    pub async fn run_until<F>(&self, scheduler: Scheduler, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => self.serve(listener, scheduler, shutdown).await,
            Err(e) => {
                tracing::error!(
                    addr = %self.config.bind_addr,
                    error = %e,
                    "Failed to bind, video delivery disabled"
                );
                shutdown.await;
                release(scheduler).await;
                Ok(())
            }
        }
    }

    /// Serve viewers on an already bound listener until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, scheduler: Scheduler, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Broadcast server listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let scheduler_task = tokio::spawn(scheduler.run_until(events_rx, async move {
            let _ = stop_rx.await;
        }));

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener, &events_tx) => result,
        };

        let _ = stop_tx.send(());
        match scheduler_task.await {
            Ok(scheduler) => release(scheduler).await,
            Err(e) => tracing::error!(error = %e, "Scheduler task failed"),
        }

        result
    }

    async fn accept_loop(&self, listener: &TcpListener, events: &mpsc::UnboundedSender<ViewerEvent>) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, events);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr, events: &mpsc::UnboundedSender<ViewerEvent>) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let viewer_id = self.next_viewer_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(viewer_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(Arc::clone(&self.counters));

        let connection = Connection::new(viewer_id, peer_addr, self.config.viewer_queue_depth, events.clone());

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;

            if let Err(e) = connection.run(socket).await {
                tracing::debug!(viewer_id, error = %e, "Connection error");
            }

            tracing::debug!(viewer_id, "Connection closed");
        });
    }
}

/// Drop the scheduler off the async runtime; capture threads are joined on drop
async fn release(scheduler: Scheduler) {
    let _ = tokio::task::spawn_blocking(move || drop(scheduler)).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::channel::{ChannelConfig, ChannelState, SourceConfig};
    use crate::scheduler::SchedulerConfig;
    use crate::source::{NetworkSourceConfig, SyntheticKind};

    fn scheduler() -> Scheduler {
        let config = ChannelConfig::new("basler", SourceConfig::Synthetic(SyntheticKind::ConnectionLost));
        let source = config.open_source(&NetworkSourceConfig::default());
        Scheduler::new(SchedulerConfig::default(), vec![ChannelState::new(config, source)])
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = message {
                return text.as_str().to_owned();
            }
        }
    }

    #[tokio::test]
    async fn test_viewer_receives_frames_and_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = BroadcastServer::new(ServerConfig::default());
        let handle = tokio::spawn(async move {
            server
                .serve(listener, scheduler(), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();

        let frame = next_text(&mut ws).await;
        let body = frame.strip_prefix("basler:").expect("frame message");
        let jpeg = STANDARD_NO_PAD.decode(body).unwrap();
        let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((image.width(), image.height()), (320, 240));

        ws.send(Message::text("AllFormData:{not valid json}")).await.unwrap();
        let reply = loop {
            let text = next_text(&mut ws).await;
            if text.starts_with("response:") {
                break text;
            }
        };
        assert_eq!(reply, "response:Error: Invalid JSON");

        // Still connected: further messages are answered and frames keep coming
        ws.send(Message::text("Status:ok")).await.unwrap();
        loop {
            let text = next_text(&mut ws).await;
            if text.starts_with("response:") {
                assert_eq!(text, "response:Message received: Status");
                break;
            }
        }
        assert!(next_text(&mut ws).await.starts_with("basler:"));

        ws.close(None).await.unwrap();
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = Arc::new(BroadcastServer::new(ServerConfig::default().max_connections(1)));
        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            running
                .serve(listener, scheduler(), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(next_text(&mut first).await.starts_with("basler:"));

        let second = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await;
        assert!(second.is_err());

        let stats = server.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.rejected_connections, 1);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = BroadcastServer::new(ServerConfig::with_addr(taken.local_addr().unwrap()));

        let result = server.run_until(scheduler(), async {}).await;

        assert!(result.is_ok());
        assert_eq!(server.stats(), ServerStats::default());
    }
}
