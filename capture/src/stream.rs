//! WebSocket delivery channel.
//!
//! # Protocol
//!
//! Every frame goes out as two consecutive messages on each connection:
//! - a text message holding the format string (e.g. `.fits.gz`)
//! - a binary message holding the payload bytes
//!
//! Clients connect to `/` on the configured port. The server runs on its
//! own thread with a single-threaded tokio runtime so the control loop never
//! awaits anything.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::delivery::{Blob, ClientSink};
use crate::error::{CaptureError, CaptureResult};

pub const DEFAULT_WS_PORT: u16 = 11623;
/// Frames buffered per socket before a slow client starts skipping
pub const DEFAULT_STREAM_BACKLOG: usize = 4;

/// Fan-out of delivered blobs to every connected socket.
#[derive(Debug, Clone)]
pub struct StreamBroadcaster {
    tx: broadcast::Sender<Blob>,
}

impl StreamBroadcaster {
    /// Clients more than `capacity` frames behind skip the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Blob> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BACKLOG)
    }
}

impl ClientSink for StreamBroadcaster {
    fn send(&self, blob: Blob) -> CaptureResult<()> {
        // No connected clients is not a failure
        let receivers = self.tx.send(blob).unwrap_or(0);
        debug!("Streamed frame to {} websocket clients", receivers);
        Ok(())
    }
}

/// Forward blobs to one client until either side goes away.
async fn stream_handler(ws: WebSocket, broadcaster: Arc<StreamBroadcaster>) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = broadcaster.subscribe();

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            blob = rx.recv() => match blob {
                Ok(blob) => {
                    if let Err(e) = sender.send(Message::Text(blob.format)).await {
                        debug!("WebSocket send error: {}", e);
                        break;
                    }
                    if let Err(e) = sender.send(Message::Binary(blob.bytes.to_vec())).await {
                        debug!("WebSocket send error: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client fell behind, skipped {} frames", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
    debug!("WebSocket connection closed");
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<StreamBroadcaster>>,
) -> Response {
    ws.on_upgrade(move |socket| stream_handler(socket, broadcaster))
}

/// Running websocket server. Dropping it stops the server.
pub struct WsStreamer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WsStreamer {
    /// Bind `port` (0 picks a free one) and start serving on a background thread.
    pub fn start(port: u16, broadcaster: Arc<StreamBroadcaster>) -> CaptureResult<Self> {
        let listener = StdTcpListener::bind(("0.0.0.0", port))
            .map_err(|e| CaptureError::io(format!("binding websocket port {port}"), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| CaptureError::io("configuring websocket listener", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CaptureError::io("reading websocket address", e))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CaptureError::io("starting websocket runtime", e))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("ws-stream".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!("WebSocket listener unusable: {}", e);
                            return;
                        }
                    };
                    let app = Router::new()
                        .route("/", get(ws_upgrade))
                        .with_state(broadcaster);
                    let shutdown = async move {
                        shutdown_rx.await.ok();
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        warn!("WebSocket server error: {}", e);
                    }
                });
            })
            .map_err(|e| CaptureError::io("spawning websocket thread", e))?;

        info!("WebSocket streaming on {}", addr);
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting clients and wait for the server thread to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("WebSocket thread panicked");
            }
            info!("WebSocket streaming on {} stopped", self.addr);
        }
    }
}

impl Drop for WsStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::ChipKind;
    use bytes::Bytes;

    fn blob(format: &str) -> Blob {
        Blob {
            chip: ChipKind::Primary,
            format: format.to_string(),
            bytes: Bytes::from_static(b"\x00\x01\x02"),
        }
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_in_order() {
        let broadcaster = StreamBroadcaster::default();
        let mut rx = broadcaster.subscribe();
        broadcaster.send(blob(".fits")).unwrap();
        broadcaster.send(blob(".fits.gz")).unwrap();
        assert_eq!(rx.recv().await.unwrap().format, ".fits");
        assert_eq!(rx.recv().await.unwrap().format, ".fits.gz");
    }

    #[tokio::test]
    async fn test_slow_subscriber_skips_oldest_frames() {
        let broadcaster = StreamBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();
        for format in [".a", ".b", ".c"] {
            broadcaster.send(blob(format)).unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().format, ".b");
        assert_eq!(rx.recv().await.unwrap().format, ".c");
    }

    #[test]
    fn test_zero_backlog_still_streams() {
        let broadcaster = StreamBroadcaster::new(0);
        let mut rx = broadcaster.subscribe();
        broadcaster.send(blob(".fits")).unwrap();
        assert_eq!(rx.try_recv().unwrap().format, ".fits");
    }

    #[test]
    fn test_send_without_clients_succeeds() {
        let broadcaster = StreamBroadcaster::default();
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(broadcaster.send(blob(".bin")).is_ok());
    }

    #[test]
    fn test_server_starts_and_stops() {
        let broadcaster = Arc::new(StreamBroadcaster::default());
        let mut streamer = WsStreamer::start(0, broadcaster).unwrap();
        assert_ne!(streamer.local_addr().port(), 0);
        streamer.stop();
        // Second stop is a no-op
        streamer.stop();
    }
}
