//! Error taxonomy.
//!
//! Setup errors ([`RegistrationError`]) surface at registration time. Every
//! runtime error reaches the application through a single [`DispatchError`]
//! passed to the dispatcher's error callback.

use thiserror::Error;

use crate::envelope::EnvelopeViolation;

/// Failure reported by the underlying full-duplex channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Read or write failed at the I/O level.
    #[error("transport i/o failed: {0}")]
    Io(String),
    /// The peer closed with a status other than normal or going-away.
    #[error("socket closed abnormally (code {code}): {reason}")]
    AbnormalClose {
        /// Close status code.
        code: u16,
        /// Close reason text, possibly empty.
        reason: String,
    },
    /// The channel is already closed.
    #[error("transport closed")]
    Closed,
}

/// Failure while writing an outbound envelope.
#[derive(Debug, Error)]
pub enum SendError {
    /// The payload could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    /// The channel rejected the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The connection has already been shut down.
    #[error("connection closed")]
    Closed,
}

/// Error returned from a handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The raw payload did not decode into the handler's payload shape.
    #[error("failed to decode payload as {shape}: {source}")]
    Decode {
        /// Type name of the expected payload.
        shape: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// A reply could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),
    /// Application-level failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Build an application-level error from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Other(anyhow::Error::msg(message))
    }
}

/// Coarse classification used for logging, metrics and policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Upgrade failure or abnormal close.
    Transport,
    /// Malformed or invalid envelope.
    Protocol,
    /// Unknown topic.
    Routing,
    /// Payload decode failure or handler-returned error.
    Handler,
}

impl ErrorKind {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Routing => "routing",
            Self::Handler => "handler",
        }
    }
}

/// Every runtime error the dispatcher reports through its error callback.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The HTTP request could not be upgraded. No connection exists.
    #[error("could not upgrade connection: {0}")]
    Upgrade(String),
    /// The channel failed or closed abnormally.
    #[error("socket closed: {0}")]
    Transport(#[source] TransportError),
    /// The frame was not a decodable envelope.
    #[error("invalid packet: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// The envelope had a zero id or an empty topic.
    #[error("invalid packet (id {id}, topic {topic:?})")]
    InvalidEnvelope {
        /// Received correlation id.
        id: i64,
        /// Received topic.
        topic: String,
        /// Which invariant was broken.
        violation: EnvelopeViolation,
    },
    /// No handler is registered for the topic.
    #[error("unknown handler: {0}")]
    UnknownTopic(String),
    /// The handler or its payload decode failed.
    #[error("handler for {topic} failed: {source}")]
    Handler {
        /// Topic of the failing handler.
        topic: String,
        /// What went wrong.
        #[source]
        source: HandlerError,
    },
}

impl DispatchError {
    /// Build an [`DispatchError::InvalidEnvelope`] from the offending fields.
    pub fn invalid_envelope(id: i64, topic: &str, violation: EnvelopeViolation) -> Self {
        Self::InvalidEnvelope {
            id,
            topic: topic.to_owned(),
            violation,
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Upgrade(_) | Self::Transport(_) => ErrorKind::Transport,
            Self::MalformedEnvelope(_) | Self::InvalidEnvelope { .. } => ErrorKind::Protocol,
            Self::UnknownTopic(_) => ErrorKind::Routing,
            Self::Handler { .. } => ErrorKind::Handler,
        }
    }

    /// Whether the error ends the session. Only routing errors are survivable.
    pub fn is_connection_fatal(&self) -> bool {
        self.kind() != ErrorKind::Routing
    }
}

/// Setup-time registration failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// A handler is already registered for the topic.
    #[error("topic already registered: {0}")]
    DuplicateTopic(String),
    /// Empty topics can never be routed.
    #[error("topic must not be empty")]
    EmptyTopic,
}
