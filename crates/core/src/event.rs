//! The event model and payload codec.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::version::Versionstamp;

/// Payload codec failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// A domain event as the store sees it.
///
/// Implementations supply a stable type name, the tag set the event should be
/// indexed under, and the serialized payload. The default payload encoding is
/// JSON over the user struct; [`encode_json`] covers the common case.
pub trait Event: Send + Sync {
    /// Stable type identifier, e.g. `"order_placed"`. Must be non-empty.
    fn event_type(&self) -> &str;

    /// Tags this event is indexed under (e.g. `"order:42"`). Duplicates are
    /// rejected at append time; order is irrelevant.
    fn tags(&self) -> Vec<String>;

    /// Serialized payload bytes.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// JSON-encode a payload struct (the default codec).
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// JSON-decode payload bytes back into a user struct.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(data).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// An event ready to be appended (no position assigned yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncommittedEvent {
    pub event_type: String,
    pub tags: Vec<String>,
    pub data: Vec<u8>,
}

impl UncommittedEvent {
    pub fn new(
        event_type: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            data,
        }
    }

    /// Build from a typed event via its own codec.
    pub fn from_event(event: &dyn Event) -> Result<Self, CodecError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            tags: event.tags(),
            data: event.encode()?,
        })
    }
}

/// An event in the log, augmented with its committed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_type: String,
    pub tags: Vec<String>,
    pub data: Vec<u8>,
    pub position: Versionstamp,
}

impl StoredEvent {
    /// Decode the payload as JSON into a user struct.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode_json(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemUpdated {
        list: String,
        delta: i64,
    }

    impl Event for ItemUpdated {
        fn event_type(&self) -> &str {
            "item_updated"
        }

        fn tags(&self) -> Vec<String> {
            vec![format!("list:{}", self.list)]
        }

        fn encode(&self) -> Result<Vec<u8>, CodecError> {
            encode_json(self)
        }
    }

    #[test]
    fn from_event_captures_type_tags_and_payload() {
        let event = ItemUpdated {
            list: "1".into(),
            delta: 3,
        };
        let uncommitted = UncommittedEvent::from_event(&event).unwrap();

        assert_eq!(uncommitted.event_type, "item_updated");
        assert_eq!(uncommitted.tags, vec!["list:1".to_string()]);

        let back: ItemUpdated = decode_json(&uncommitted.data).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn stored_event_payload_round_trips() {
        let event = ItemUpdated {
            list: "9".into(),
            delta: -1,
        };
        let stored = StoredEvent {
            event_type: "item_updated".into(),
            tags: vec!["list:9".into()],
            data: encode_json(&event).unwrap(),
            position: Versionstamp::ZERO,
        };
        assert_eq!(stored.decode_json::<ItemUpdated>().unwrap(), event);
    }

    #[test]
    fn malformed_payload_surfaces_as_codec_error() {
        assert!(matches!(
            decode_json::<ItemUpdated>(b"not json"),
            Err(CodecError::Malformed(_))
        ));
    }
}
