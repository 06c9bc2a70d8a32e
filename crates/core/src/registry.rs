//! Decoder registry mapping event type names to typed decoders.
//!
//! Registries are explicit values assembled at startup and passed where they
//! are needed; nothing self-registers behind the caller's back.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::event::{CodecError, StoredEvent};

type Decoder<E> = Box<dyn Fn(&StoredEvent) -> Result<E, CodecError> + Send + Sync>;

/// Maps event type names to decode closures producing the caller's event
/// representation `E` (typically an enum over the watched event structs).
pub struct EventRegistry<E> {
    decoders: BTreeMap<String, Decoder<E>>,
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// Register a JSON-decoded payload type under `event_type`, wrapped into
    /// `E` by `wrap`. A later registration for the same name replaces the
    /// earlier one.
    pub fn register<T, F>(&mut self, event_type: impl Into<String>, wrap: F)
    where
        T: DeserializeOwned,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.decoders.insert(
            event_type.into(),
            Box::new(move |stored| stored.decode_json::<T>().map(&wrap)),
        );
    }

    /// Register a raw decoder for payloads that are not JSON.
    pub fn register_raw<F>(&mut self, event_type: impl Into<String>, decode: F)
    where
        F: Fn(&StoredEvent) -> Result<E, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(event_type.into(), Box::new(decode));
    }

    /// Decode a stored event, failing with `UnknownEventType` when the type
    /// was never registered.
    pub fn decode(&self, stored: &StoredEvent) -> Result<E, CodecError> {
        let decoder = self
            .decoders
            .get(&stored.event_type)
            .ok_or_else(|| CodecError::UnknownEventType(stored.event_type.clone()))?;
        decoder(stored)
    }

    /// The registered type names, in sorted order.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encode_json;
    use crate::version::Versionstamp;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ListCreated {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemUpdated {
        delta: i64,
    }

    #[derive(Debug, PartialEq)]
    enum ListEvent {
        Created(ListCreated),
        Updated(ItemUpdated),
    }

    fn stored(event_type: &str, data: Vec<u8>) -> StoredEvent {
        StoredEvent {
            event_type: event_type.into(),
            tags: vec![],
            data,
            position: Versionstamp::ZERO,
        }
    }

    fn registry() -> EventRegistry<ListEvent> {
        let mut reg = EventRegistry::new();
        reg.register("list_created", ListEvent::Created);
        reg.register("item_updated", ListEvent::Updated);
        reg
    }

    #[test]
    fn decodes_registered_types() {
        let reg = registry();
        let ev = stored(
            "list_created",
            encode_json(&ListCreated { name: "x".into() }).unwrap(),
        );
        assert_eq!(
            reg.decode(&ev).unwrap(),
            ListEvent::Created(ListCreated { name: "x".into() })
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        let reg = registry();
        let ev = stored("list_archived", b"{}".to_vec());
        assert!(matches!(
            reg.decode(&ev),
            Err(CodecError::UnknownEventType(t)) if t == "list_archived"
        ));
    }

    #[test]
    fn bad_payload_is_malformed() {
        let reg = registry();
        let ev = stored("item_updated", b"[1,2".to_vec());
        assert!(matches!(reg.decode(&ev), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn event_types_are_sorted() {
        let reg = registry();
        let names: Vec<&str> = reg.event_types().collect();
        assert_eq!(names, vec!["item_updated", "list_created"]);
    }
}
