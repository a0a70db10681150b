//! Event payloads, their stored encoding, and the recorded form returned by
//! the log.
//!
//! Domain events are modelled as one adjacently tagged serde enum per
//! application (`#[serde(tag = "type", content = "data")]`). The variant tag is
//! the event's type name and the registry key; the `data` part is the payload
//! that gets stored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Fixed namespace for deterministic aggregate id derivation.
const AGGREGATE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x61, 0x0e, 0x92, 0x7b, 0x54, 0x4f, 0x1d, 0x9e, 0x2a, 0x85, 0xd0, 0x4b, 0x17, 0xc6, 0x39,
]);

/// A domain event payload.
///
/// Blanket-implemented for every adjacently tagged enum (or any other type)
/// that meets the bounds. The type name of a value is derived from its serde
/// tag, never from a stored field.
pub trait Event: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Event for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{}

/// The generic stored form of an event: type name plus serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    /// Registry key (the serde variant tag).
    pub event_type: String,
    /// JSON text of the variant's `data` part (`null` for unit variants).
    pub payload: String,
}

/// The durable, sequenced form of an event.
///
/// Produced only by the event log. `sequence` is assigned at append time and
/// is unique and strictly increasing across the whole log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent<E> {
    /// Position in the global log, starting at 1.
    pub sequence: i64,
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Registry key the payload was stored under.
    pub event_type: String,
    /// Decoded payload.
    pub payload: E,
    /// Time the row was written.
    pub recorded_at: DateTime<Utc>,
}

/// Iteration order for [`load_all`](crate::EventStore::load_all).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Derive a deterministic aggregate id from a natural key.
///
/// Uses UUID v5 over a fixed namespace, so the same name always maps to the
/// same id regardless of which process performs the mapping.
///
/// # Examples
///
/// ```
/// let a = evoke::derive_id("customer:alice@example.com");
/// assert_eq!(a, evoke::derive_id("customer:alice@example.com"));
/// ```
pub fn derive_id(name: &str) -> String {
    Uuid::new_v5(&AGGREGATE_NAMESPACE, name.as_bytes())
        .simple()
        .to_string()
}

/// Generate a fresh random aggregate id (32 lowercase hex characters).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_id_is_deterministic() {
        assert_eq!(derive_id("order-1"), derive_id("order-1"));
    }

    #[test]
    fn derive_id_differs_by_name() {
        assert_ne!(derive_id("order-1"), derive_id("order-2"));
    }

    #[test]
    fn new_id_is_lowercase_hex() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_id());
    }

    #[test]
    fn load_order_defaults_to_ascending() {
        assert_eq!(LoadOrder::default(), LoadOrder::Ascending);
    }
}
