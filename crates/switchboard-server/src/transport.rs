//! Full-duplex frame channel abstraction.
//!
//! The dispatcher reads frames through a [`FrameReader`] and writes through a
//! [`FrameWriter`]. Production connections use the axum WebSocket halves;
//! [`memory`] provides an in-process pair for tests and embedders.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use switchboard_core::TransportError;

/// Close codes treated as an orderly shutdown: normal, going away, no status.
const ORDERLY_CLOSE_CODES: [u16; 3] = [1000, 1001, 1005];

/// Result of reading from the channel.
#[derive(Debug)]
pub enum Inbound {
    /// One complete data frame.
    Frame(Bytes),
    /// The peer closed the channel in an orderly way.
    Closed,
    /// The channel failed or the peer closed abnormally.
    Failed(TransportError),
}

/// Read half of a full-duplex channel.
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next data frame or a terminal condition.
    async fn read_frame(&mut self) -> Inbound;
}

/// Write half of a full-duplex channel.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete text frame.
    async fn write_frame(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Map a close frame to an [`Inbound`] outcome.
fn close_outcome(frame: Option<(u16, String)>) -> Inbound {
    match frame {
        None => Inbound::Closed,
        Some((code, _)) if ORDERLY_CLOSE_CODES.contains(&code) => Inbound::Closed,
        Some((code, reason)) => Inbound::Failed(TransportError::AbnormalClose { code, reason }),
    }
}

/// Read half of an upgraded axum WebSocket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

/// Write half of an upgraded axum WebSocket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into dispatcher halves.
pub fn split_websocket(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Inbound {
        loop {
            let Some(msg) = self.stream.next().await else {
                return Inbound::Closed;
            };
            match msg {
                Ok(Message::Text(text)) => {
                    return Inbound::Frame(Bytes::from(text));
                }
                Ok(Message::Binary(data)) => return Inbound::Frame(data),
                // axum answers pings itself
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    return close_outcome(frame.map(|f| (f.code, f.reason.as_str().to_owned())));
                }
                Err(e) => return Inbound::Failed(TransportError::Io(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// In-process channel pair.
pub mod memory {
    use super::{async_trait, Bytes, FrameReader, FrameWriter, Inbound, TransportError};
    use tokio::sync::mpsc;

    enum PeerEvent {
        Frame(Bytes),
        Close,
        Abort(TransportError),
    }

    /// Server-side read half.
    pub struct MemoryReader {
        rx: mpsc::Receiver<PeerEvent>,
    }

    /// Server-side write half.
    pub struct MemoryWriter {
        tx: Option<mpsc::Sender<String>>,
    }

    /// The client end of the pair.
    pub struct MemoryPeer {
        tx: mpsc::Sender<PeerEvent>,
        rx: mpsc::Receiver<String>,
    }

    /// Create a connected pair with `capacity` buffered frames per direction.
    pub fn duplex(capacity: usize) -> (MemoryReader, MemoryWriter, MemoryPeer) {
        let (peer_tx, server_rx) = mpsc::channel(capacity);
        let (server_tx, peer_rx) = mpsc::channel(capacity);
        (
            MemoryReader { rx: server_rx },
            MemoryWriter {
                tx: Some(server_tx),
            },
            MemoryPeer {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }

    #[async_trait]
    impl FrameReader for MemoryReader {
        async fn read_frame(&mut self) -> Inbound {
            match self.rx.recv().await {
                Some(PeerEvent::Frame(frame)) => Inbound::Frame(frame),
                Some(PeerEvent::Close) | None => Inbound::Closed,
                Some(PeerEvent::Abort(err)) => Inbound::Failed(err),
            }
        }
    }

    #[async_trait]
    impl FrameWriter for MemoryWriter {
        async fn write_frame(&mut self, frame: String) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(frame).await.map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.tx.take().map(drop).ok_or(TransportError::Closed)
        }
    }

    impl MemoryPeer {
        /// Send a raw text frame. Returns `false` once the server stopped reading.
        pub async fn send_text(&self, text: &str) -> bool {
            self.tx
                .send(PeerEvent::Frame(Bytes::copy_from_slice(text.as_bytes())))
                .await
                .is_ok()
        }

        /// Close orderly.
        pub async fn close(&self) -> bool {
            self.tx.send(PeerEvent::Close).await.is_ok()
        }

        /// Fail the channel as if the socket broke.
        pub async fn abort(&self, err: TransportError) -> bool {
            self.tx.send(PeerEvent::Abort(err)).await.is_ok()
        }

        /// Next frame written by the server, `None` once the server closed.
        pub async fn recv(&mut self) -> Option<String> {
            self.rx.recv().await
        }

        /// Next frame parsed as JSON.
        pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
            let text = self.recv().await?;
            serde_json::from_str(&text).ok()
        }
    }
}
