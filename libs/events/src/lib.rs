//! # fleet-events
//!
//! Event type definitions and wire payloads shared by the fleet control plane
//! and its node agents.
//!
//! ## Design Principles
//!
//! - Events are immutable records of state transitions observed by a component
//! - Events never contain secrets (token plaintexts, signing keys)
//! - Every event carries the id of the node or job it concerns
//!
//! ## Event Envelope
//!
//! Published events are wrapped in an [`EventEnvelope`] carrying a monotonic
//! `event_id` assigned by the publisher and the time the event occurred.
//!
//! ## Event Types
//!
//! - Circuit events (`circuit.*`)
//! - Node health events (`node.*`)
//! - Priority events (`job.*`)
//! - Scaling events (`scaling.*`)
//! - Drain events (`drain.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
