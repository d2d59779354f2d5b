//! Read-dispatch loop.
//!
//! One [`Dispatcher::serve`] call runs one connection through
//! `Init → PreHooks → Serving → PostHooks → Closed`. Frames are handled one at
//! a time in arrival order; the next frame is not read until the previous
//! handler has returned.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use switchboard_core::{DispatchError, Envelope, HandlerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, Request, RequestMetadata};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, ERRORS_TOTAL, FRAMES_TOTAL, HANDLER_DURATION_SECONDS,
};
use crate::registry::TopicRegistry;
use crate::transport::{FrameReader, FrameWriter, Inbound};

/// Callback run once before serving starts or once after it ends.
pub type Hook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Receives every runtime error. The connection is absent for upgrade failures.
pub type ErrorHandler = Arc<dyn Fn(Option<&Arc<Connection>>, &DispatchError) + Send + Sync>;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the channel in an orderly way.
    PeerClosed,
    /// The channel failed or closed abnormally.
    TransportFailed,
    /// A frame could not be decoded as an envelope.
    MalformedEnvelope,
    /// An envelope had a zero id or an empty topic.
    InvalidEnvelope,
    /// A handler or its payload decode failed.
    HandlerFailed,
}

impl SessionEnd {
    /// Short label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportFailed => "transport_failed",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::InvalidEnvelope => "invalid_envelope",
            Self::HandlerFailed => "handler_failed",
        }
    }
}

/// Error handler used when none is configured: log and move on.
pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|conn: Option<&Arc<Connection>>, err: &DispatchError| {
        let connection_id = conn.map_or("-", |c| c.id());
        warn!(
            connection_id,
            kind = err.kind().as_str(),
            fatal = err.is_connection_fatal(),
            error = %err,
            "dispatch error"
        );
    })
}

/// Collects the registry, hooks and error handler before serving begins.
pub struct DispatcherBuilder {
    registry: TopicRegistry,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
    error_handler: ErrorHandler,
}

impl DispatcherBuilder {
    /// Start from a populated registry.
    pub fn new(registry: TopicRegistry) -> Self {
        Self {
            registry,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            error_handler: log_error_handler(),
        }
    }

    /// Mutable access to the registry while still in setup.
    pub fn registry_mut(&mut self) -> &mut TopicRegistry {
        &mut self.registry
    }

    /// Append a hook run before the first read. Hooks run in registration order.
    pub fn add_pre_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.pre_hooks.push(Arc::new(hook));
        self
    }

    /// Append a hook run after the loop exits. Hooks run in registration order.
    pub fn add_post_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.post_hooks.push(Arc::new(hook));
        self
    }

    /// Replace the error handler.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Arc<Connection>>, &DispatchError) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Freeze the setup. Nothing can be registered afterwards.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            registry: self.registry,
            pre_hooks: self.pre_hooks,
            post_hooks: self.post_hooks,
            error_handler: self.error_handler,
            active: AtomicUsize::new(0),
        }
    }
}

/// Owns the frozen registry and hooks; serves connections.
///
/// Share it behind an `Arc`; every connection reads the same registry without
/// locking.
pub struct Dispatcher {
    registry: TopicRegistry,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
    error_handler: ErrorHandler,
    active: AtomicUsize,
}

impl Dispatcher {
    /// Start building a dispatcher around `registry`.
    pub fn builder(registry: TopicRegistry) -> DispatcherBuilder {
        DispatcherBuilder::new(registry)
    }

    /// The frozen registry.
    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Report an error through the configured callback.
    pub fn report(&self, conn: Option<&Arc<Connection>>, err: &DispatchError) {
        counter!(ERRORS_TOTAL, "kind" => err.kind().as_str()).increment(1);
        (self.error_handler)(conn, err);
    }

    /// Serve one connection until it ends.
    ///
    /// `scope` is the cancellation scope of the originating request; the
    /// connection gets a child of it. The channel is closed on every exit path.
    #[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
    pub async fn serve<R, W>(
        &self,
        mut reader: R,
        writer: W,
        metadata: RequestMetadata,
        scope: &CancellationToken,
    ) -> SessionEnd
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        let conn = Arc::new(Connection::new(
            Box::new(writer),
            metadata,
            scope.child_token(),
        ));
        let _ = tracing::Span::current().record("connection_id", conn.id());

        let _ = self.active.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(uri = %conn.metadata().uri, "connection opened");

        for hook in &self.pre_hooks {
            hook(&conn);
        }

        let end = self.read_loop(&mut reader, &conn).await;

        for hook in &self.post_hooks {
            hook(&conn);
        }
        conn.cancel();
        let _ = conn.close().await;

        let _ = self.active.fetch_sub(1, Ordering::Relaxed);
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            reason = end.as_str(),
            duration_secs = conn.age().as_secs_f64(),
            "connection closed"
        );
        end
    }

    async fn read_loop<R: FrameReader>(&self, reader: &mut R, conn: &Arc<Connection>) -> SessionEnd {
        loop {
            let frame = match reader.read_frame().await {
                Inbound::Frame(frame) => frame,
                Inbound::Closed => return SessionEnd::PeerClosed,
                Inbound::Failed(e) => {
                    self.report(Some(conn), &DispatchError::Transport(e));
                    return SessionEnd::TransportFailed;
                }
            };

            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.report(Some(conn), &DispatchError::MalformedEnvelope(e));
                    return SessionEnd::MalformedEnvelope;
                }
            };

            if let Err(violation) = envelope.validate() {
                let err = DispatchError::invalid_envelope(envelope.id, &envelope.topic, violation);
                self.report(Some(conn), &err);
                return SessionEnd::InvalidEnvelope;
            }

            let Some(descriptor) = self.registry.get(&envelope.topic) else {
                self.report(Some(conn), &DispatchError::UnknownTopic(envelope.topic));
                continue;
            };

            let topic = envelope.topic.clone();
            counter!(FRAMES_TOTAL, "topic" => topic.clone()).increment(1);
            debug!(id = envelope.id, topic = %topic, "dispatching");

            let start = Instant::now();
            let invocation = descriptor.invoke(Request::from_envelope(Arc::clone(conn), envelope));
            let result = AssertUnwindSafe(invocation)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::msg(panic_message(panic.as_ref()))));
            histogram!(HANDLER_DURATION_SECONDS, "topic" => topic.clone())
                .record(start.elapsed().as_secs_f64());

            if let Err(source) = result {
                self.report(Some(conn), &DispatchError::Handler { topic, source });
                return SessionEnd::HandlerFailed;
            }
        }
    }
}

/// Text of a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    format!("handler panicked: {detail}")
}
