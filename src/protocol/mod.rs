//! Wire protocol: envelopes, delivery status and the envelope history.

pub mod envelope;
pub mod history;
pub mod types;

pub use envelope::{unix_now, Envelope, EnvelopeBuilder, ENVELOPE_VERSION};
pub use history::{EnvelopeHistory, EnvelopeRecord};
pub use types::{DeliveryStatus, IncomingMessage, MsgStatus, CONNECTION_HEADER, SYNC_CONNECTION};
