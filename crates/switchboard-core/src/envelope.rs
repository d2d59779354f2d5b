//! The `{ID, Topic, Data}` envelope exchanged in both directions.
//!
//! Inbound envelopes keep `Data` as raw JSON so that decoding into the
//! handler's payload type happens exactly once, inside the handler thunk.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// JSON literal used when an envelope carries no `Data`.
const NULL_PAYLOAD: &str = "null";

/// An inbound envelope as read from the wire.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Client-chosen correlation id. Must be nonzero.
    #[serde(rename = "ID", alias = "id", default)]
    pub id: i64,
    /// Topic used to route the envelope. Must be nonempty.
    #[serde(rename = "Topic", alias = "topic", default)]
    pub topic: String,
    /// Opaque payload, decoded later by the handler.
    #[serde(rename = "Data", alias = "data", default)]
    pub data: Option<Box<RawValue>>,
}

/// Why a decoded envelope was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeViolation {
    /// `ID` was missing or zero.
    ZeroId,
    /// `Topic` was missing or empty.
    EmptyTopic,
}

impl Envelope {
    /// Decode one frame into an envelope.
    ///
    /// Fails when the frame is not a JSON object or a field has the wrong type.
    /// Missing fields decode to their zero values and are caught by
    /// [`Envelope::validate`].
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }

    /// Check the nonzero-id / nonempty-topic invariant.
    pub fn validate(&self) -> Result<(), EnvelopeViolation> {
        if self.id == 0 {
            return Err(EnvelopeViolation::ZeroId);
        }
        if self.topic.is_empty() {
            return Err(EnvelopeViolation::EmptyTopic);
        }
        Ok(())
    }

    /// Raw payload JSON, `null` when absent.
    pub fn payload_json(&self) -> &str {
        self.data.as_deref().map_or(NULL_PAYLOAD, RawValue::get)
    }
}

/// An outbound envelope borrowing its parts.
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize + ?Sized> {
    /// Correlation id echoed back to the client.
    #[serde(rename = "ID")]
    pub id: i64,
    /// Topic the reply belongs to.
    #[serde(rename = "Topic")]
    pub topic: &'a str,
    /// Reply payload.
    #[serde(rename = "Data")]
    pub data: &'a T,
}

/// Encode `{ID, Topic, Data}` into a single text frame.
pub fn encode_envelope<T: Serialize + ?Sized>(
    id: i64,
    topic: &str,
    data: &T,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundEnvelope { id, topic, data })
}
