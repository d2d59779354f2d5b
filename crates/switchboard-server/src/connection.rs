//! Per-connection state and the per-message request view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use switchboard_core::{encode_envelope, Envelope, HandlerError, SendError, Values};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::transport::FrameWriter;

/// Read-only view of the HTTP request that opened the connection.
#[derive(Clone, Debug)]
pub struct RequestMetadata {
    /// Request method (always GET for upgraded connections).
    pub method: Method,
    /// Request URI including query.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RequestMetadata {
    /// Bundle request parts.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new(Method::GET, Uri::from_static("/"), HeaderMap::new())
    }
}

/// State of one accepted connection.
///
/// Owns the write half of the channel. All outbound frames go through a single
/// async mutex so concurrent senders never interleave on the wire.
pub struct Connection {
    id: String,
    metadata: RequestMetadata,
    values: Values,
    scope: CancellationToken,
    writer: Mutex<Option<Box<dyn FrameWriter>>>,
    closed: AtomicBool,
    connected_at: Instant,
}

impl Connection {
    /// Wrap a channel writer. `scope` should already be derived for this connection.
    pub fn new(
        writer: Box<dyn FrameWriter>,
        metadata: RequestMetadata,
        scope: CancellationToken,
    ) -> Self {
        Self {
            id: format!("conn_{}", Uuid::now_v7()),
            metadata,
            values: Values::new(),
            scope,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            connected_at: Instant::now(),
        }
    }

    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The request that initiated the upgrade.
    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Connection-scoped value store.
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Cancellation scope for work spawned on behalf of this connection.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.scope
    }

    /// Cancel the connection scope. Does not close the channel.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Whether the connection scope was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Encode `{ID, Topic, Data}` and write it as one frame.
    ///
    /// Safe to call from any task holding the connection.
    pub async fn send<T>(&self, id: i64, topic: &str, data: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        let frame = encode_envelope(id, topic, data)?;
        self.write(frame).await
    }

    async fn write(&self, frame: String) -> Result<(), SendError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SendError::Closed)?;
        if let Err(e) = writer.write_frame(frame).await {
            debug!(connection_id = %self.id, error = %e, "frame write failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the channel. Only the first call has an effect.
    ///
    /// Returns `true` if this call closed the channel.
    pub async fn close(&self) -> bool {
        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return false;
        };
        self.closed.store(true, Ordering::Release);
        if let Err(e) = writer.close().await {
            debug!(connection_id = %self.id, error = %e, "channel close failed");
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("uri", &self.metadata.uri)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One inbound message as seen by a handler.
#[derive(Debug)]
pub struct Request {
    connection: Arc<Connection>,
    id: i64,
    topic: String,
    data: Option<Box<RawValue>>,
}

impl Request {
    /// Build a request from a validated envelope.
    pub fn from_envelope(connection: Arc<Connection>, envelope: Envelope) -> Self {
        Self {
            connection,
            id: envelope.id,
            topic: envelope.topic,
            data: envelope.data,
        }
    }

    /// The connection the message arrived on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Correlation id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Undecoded payload JSON, `null` when absent.
    pub fn raw_payload(&self) -> &str {
        self.data.as_deref().map_or("null", RawValue::get)
    }

    /// Decode the payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_str(self.raw_payload()).map_err(|source| HandlerError::Decode {
            shape: std::any::type_name::<T>(),
            source,
        })
    }

    /// Reply with the triggering request's id and topic.
    pub async fn respond<T>(&self, data: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        self.connection.send(self.id, &self.topic, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{duplex, MemoryPeer};
    use serde_json::json;

    fn make_connection() -> (Arc<Connection>, MemoryPeer) {
        let (_reader, writer, peer) = duplex(64);
        let conn = Connection::new(
            Box::new(writer),
            RequestMetadata::default(),
            CancellationToken::new(),
        );
        (Arc::new(conn), peer)
    }

    fn request(conn: &Arc<Connection>, frame: &str) -> Request {
        let env = Envelope::decode(frame.as_bytes()).unwrap();
        Request::from_envelope(Arc::clone(conn), env)
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _pa) = make_connection();
        let (b, _pb) = make_connection();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("conn_"));
    }

    #[tokio::test]
    async fn send_writes_envelope() {
        let (conn, mut peer) = make_connection();
        conn.send(5, "news", &json!({"k": "v"})).await.unwrap();
        let frame = peer.recv_json().await.unwrap();
        assert_eq!(frame["ID"], 5);
        assert_eq!(frame["Topic"], "news");
        assert_eq!(frame["Data"]["k"], "v");
    }

    #[tokio::test]
    async fn respond_reuses_id_and_topic() {
        let (conn, mut peer) = make_connection();
        let req = request(&conn, r#"{"ID":1,"Topic":"echo","Data":"hi"}"#);
        req.respond("hi").await.unwrap();
        assert_eq!(
            peer.recv().await.as_deref(),
            Some(r#"{"ID":1,"Topic":"echo","Data":"hi"}"#)
        );
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, mut peer) = make_connection();
        assert!(conn.close().await);
        assert!(conn.is_closed());
        assert!(peer.recv().await.is_none());
        let err = conn.send(1, "t", &()).await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _peer) = make_connection();
        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(!conn.close().await);
    }

    #[tokio::test]
    async fn write_failure_releases_guard() {
        let (conn, peer) = make_connection();
        drop(peer);
        let first = conn.send(1, "t", "x").await;
        assert!(matches!(first, Err(SendError::Transport(_))));
        // guard must be free again
        let second = conn.send(2, "t", "y").await;
        assert!(matches!(second, Err(SendError::Transport(_))));
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (conn, mut peer) = make_connection();
        let mut tasks = Vec::new();
        for i in 1..=32_i64 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.send(i, "burst", &"x".repeat(512)).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..32 {
            let frame = peer.recv_json().await.expect("well-formed frame");
            assert_eq!(frame["Topic"], "burst");
            assert_eq!(frame["Data"].as_str().unwrap().len(), 512);
            seen.push(frame["ID"].as_i64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=32).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_does_not_close() {
        let (conn, _peer) = make_connection();
        let child = conn.cancellation().child_token();
        conn.cancel();
        assert!(conn.is_cancelled());
        assert!(child.is_cancelled());
        assert!(!conn.is_closed());
    }

    #[test]
    fn payload_decodes_typed() {
        let (conn, _peer) = make_connection();
        let req = request(&conn, r#"{"ID":3,"Topic":"sum","Data":[1,2,3]}"#);
        let nums: Vec<u32> = req.payload().unwrap();
        assert_eq!(nums, vec![1, 2, 3]);
        assert_eq!(req.id(), 3);
        assert_eq!(req.topic(), "sum");
        assert_eq!(req.raw_payload(), "[1,2,3]");
    }

    #[test]
    fn payload_decode_failure_names_shape() {
        let (conn, _peer) = make_connection();
        let req = request(&conn, r#"{"ID":3,"Topic":"sum","Data":"nope"}"#);
        let err = req.payload::<Vec<u32>>().unwrap_err();
        match err {
            HandlerError::Decode { shape, .. } => assert!(shape.contains("Vec")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn values_visible_through_request() {
        let (conn, _peer) = make_connection();
        let _ = conn.values().insert("user", String::from("bob"));
        let req = request(&conn, r#"{"ID":1,"Topic":"t"}"#);
        assert_eq!(
            req.connection().values().get::<String>("user").as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn metadata_header_lookup() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-client", "ios".parse().unwrap());
        let meta = RequestMetadata::new(Method::GET, Uri::from_static("/ws?x=1"), headers);
        assert_eq!(meta.header("x-client"), Some("ios"));
        assert_eq!(meta.header("missing"), None);
        assert_eq!(meta.uri.query(), Some("x=1"));
    }
}
