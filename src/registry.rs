//! Name-to-decoder table that lets payloads be stored generically and
//! decoded back into the application's event enum.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::event::{EncodedEvent, Event};

/// Decoder for one event type: turns a stored payload back into `E`.
type DecodeFn<E> = Arc<dyn Fn(&str, &str) -> serde_json::Result<E> + Send + Sync>;

/// Registry of every event type name the log may write or read.
///
/// Populated once during bootstrap and shared read-only afterwards (the event
/// log holds it behind an `Arc`). Encoding an event whose type was never
/// registered fails, and so does decoding a row stored under an unknown name;
/// there is no fallback decoder.
///
/// # Examples
///
/// ```
/// use evoke::TypeRegistry;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum OrderEvent {
///     OrderCreated { id: String },
///     OrderShipped { id: String },
/// }
///
/// let mut registry = TypeRegistry::<OrderEvent>::new();
/// registry.register_all(["OrderCreated", "OrderShipped"]);
///
/// let event = OrderEvent::OrderCreated { id: "A".into() };
/// let encoded = registry.encode(&event).unwrap();
/// assert_eq!(encoded.event_type, "OrderCreated");
/// assert_eq!(registry.decode(&encoded.event_type, &encoded.payload).unwrap(), event);
/// ```
pub struct TypeRegistry<E> {
    decoders: HashMap<String, DecodeFn<E>>,
}

impl<E> fmt::Debug for TypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("event_types", &names)
            .finish()
    }
}

impl<E: Event> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> TypeRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a variant name with the default adjacently tagged decoder.
    ///
    /// Registering the same name twice replaces the earlier decoder.
    pub fn register(&mut self, event_type: impl Into<String>) -> &mut Self {
        let event_type = event_type.into();
        self.insert(event_type, Arc::new(decode_tagged::<E>));
        self
    }

    /// Register several variant names with the default decoder.
    pub fn register_all<I, S>(&mut self, event_types: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for event_type in event_types {
            self.register(event_type);
        }
        self
    }

    /// Register a name with a custom decoder.
    ///
    /// The decoder receives the stored payload text. Useful for names that
    /// were written by an older shape and must be mapped onto a current
    /// variant.
    pub fn register_with<F>(&mut self, event_type: impl Into<String>, decoder: F) -> &mut Self
    where
        F: Fn(&str) -> serde_json::Result<E> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        self.insert(event_type, Arc::new(move |_: &str, payload: &str| decoder(payload)));
        self
    }

    fn insert(&mut self, event_type: String, decoder: DecodeFn<E>) {
        if self.decoders.insert(event_type.clone(), decoder).is_some() {
            tracing::warn!(%event_type, "event type registered twice, last registration wins");
        }
    }

    /// Returns `true` if `event_type` has a decoder.
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered type names, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered type names.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Split an event into its type name and serialized payload.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MalformedPayload`] if the value does not serialize to
    ///   an adjacently tagged object: a string `"type"` field, an optional
    ///   `"data"` field and nothing else.
    /// - [`StoreError::UnregisteredType`] if the derived name is unknown.
    pub fn encode(&self, event: &E) -> Result<EncodedEvent, StoreError> {
        let shape = std::any::type_name::<E>();
        let value = serde_json::to_value(event).map_err(|source| StoreError::MalformedPayload {
            event_type: shape.to_string(),
            source,
        })?;
        let Value::Object(mut obj) = value else {
            return Err(StoreError::malformed(
                shape,
                "event must serialize to an adjacently tagged object",
            ));
        };
        let event_type = match obj.remove("type") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(StoreError::malformed(
                    shape,
                    "event is missing a string \"type\" tag",
                ));
            }
        };
        if !self.is_registered(&event_type) {
            return Err(StoreError::UnregisteredType { event_type });
        }

        // Unit variants carry no "data" key.
        let data = obj.remove("data").unwrap_or(Value::Null);
        if let Some(extra) = obj.keys().next() {
            return Err(StoreError::malformed(
                event_type,
                format!("unexpected field {extra:?} next to the tag; events must be adjacently tagged"),
            ));
        }
        let payload = serde_json::to_string(&data).map_err(|source| {
            StoreError::MalformedPayload {
                event_type: event_type.clone(),
                source,
            }
        })?;
        Ok(EncodedEvent {
            event_type,
            payload,
        })
    }

    /// Decode a stored payload back into its event value.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnregisteredType`] if `event_type` is unknown.
    /// - [`StoreError::MalformedPayload`] if deserialization fails.
    pub fn decode(&self, event_type: &str, payload: &str) -> Result<E, StoreError> {
        let decoder =
            self.decoders
                .get(event_type)
                .ok_or_else(|| StoreError::UnregisteredType {
                    event_type: event_type.to_string(),
                })?;
        decoder(event_type, payload).map_err(|source| StoreError::MalformedPayload {
            event_type: event_type.to_string(),
            source,
        })
    }
}

/// Rebuild the adjacently tagged object from a type name and stored payload.
///
/// A `null` payload is either a unit variant (stored without `"data"`) or a
/// variant whose content serializes to `null`; the full form is tried first.
fn decode_tagged<E: Event>(event_type: &str, payload: &str) -> serde_json::Result<E> {
    let data: Value = serde_json::from_str(payload)?;
    let is_null = data.is_null();
    match serde_json::from_value(serde_json::json!({ "type": event_type, "data": data })) {
        Err(err) if is_null => {
            serde_json::from_value(serde_json::json!({ "type": event_type })).map_err(|_| err)
        }
        result => result,
    }
}
