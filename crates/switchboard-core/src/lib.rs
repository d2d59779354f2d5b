//! # switchboard-core
//!
//! Shared building blocks for the switchboard dispatcher:
//!
//! - [`envelope`]: the `{ID, Topic, Data}` wire unit, decoding and validation
//! - [`errors`]: the runtime error taxonomy handed to the error callback
//! - [`values`]: the per-connection heterogeneous value store

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod values;

pub use envelope::{encode_envelope, Envelope, EnvelopeViolation, OutboundEnvelope};
pub use errors::{
    DispatchError, ErrorKind, HandlerError, RegistrationError, SendError, TransportError,
};
pub use values::Values;
