//! Invalidation events and their wire form.
//!
//! [`InvalidationEvent`] is what subscribers on an [`EventBus`](crate::EventBus)
//! receive. [`InvalidationMessage`] is the tagged, serializable envelope that
//! travels between processes; it carries the sender id used to discard
//! self-originated echoes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stratum_core::{EntityId, EventError, StratumResult, Timestamp};
use uuid::Uuid;

/// What happened to a collection in another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The id now holds this payload.
    Update { id: EntityId, data: Vec<u8> },
    /// The id was removed.
    Removal { id: EntityId },
    /// Every record in the collection was dropped.
    Clear,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Update { .. } => "update",
            EventKind::Removal { .. } => "removal",
            EventKind::Clear => "clear",
        }
    }

    /// The record id, for update and removal events.
    pub fn id(&self) -> Option<EntityId> {
        match self {
            EventKind::Update { id, .. } | EventKind::Removal { id } => Some(*id),
            EventKind::Clear => None,
        }
    }
}

/// An invalidation delivered to local subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Collection the event applies to.
    pub collection: String,
    /// The mutation.
    pub kind: EventKind,
}

impl InvalidationEvent {
    pub fn update(collection: impl Into<String>, id: EntityId, data: Vec<u8>) -> Self {
        Self {
            collection: collection.into(),
            kind: EventKind::Update { id, data },
        }
    }

    pub fn removal(collection: impl Into<String>, id: EntityId) -> Self {
        Self {
            collection: collection.into(),
            kind: EventKind::Removal { id },
        }
    }

    pub fn clear(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            kind: EventKind::Clear,
        }
    }
}

// ============================================================================
// WIRE MESSAGE
// ============================================================================

/// Wire discriminator for [`InvalidationMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Update,
    Removal,
    Clear,
}

/// Serializable envelope exchanged between processes.
///
/// Encoded as JSON with the payload hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Identifier of the publishing updater instance.
    pub sender: Uuid,
    /// When the message was published.
    pub sent_at: Timestamp,
    pub collection: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_payload")]
    pub payload: Option<Vec<u8>>,
}

impl InvalidationMessage {
    /// Wrap an event for publication by `sender`.
    pub fn new(sender: Uuid, event: InvalidationEvent) -> Self {
        let (kind, id, payload) = match event.kind {
            EventKind::Update { id, data } => (MessageKind::Update, Some(id), Some(data)),
            EventKind::Removal { id } => (MessageKind::Removal, Some(id), None),
            EventKind::Clear => (MessageKind::Clear, None, None),
        };
        Self {
            sender,
            sent_at: Utc::now(),
            collection: event.collection,
            kind,
            id,
            payload,
        }
    }

    /// Whether this message was published by `sender`.
    pub fn is_from(&self, sender: Uuid) -> bool {
        self.sender == sender
    }

    pub fn encode(&self) -> StratumResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            EventError::Encode {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn decode(bytes: &[u8]) -> StratumResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            EventError::Decode {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Convert into the event delivered to local subscribers.
    ///
    /// Fails when an update or removal is missing its id, or an update is
    /// missing its payload.
    pub fn into_event(self) -> StratumResult<InvalidationEvent> {
        let missing = |field: &str| EventError::Decode {
            reason: format!("{} message without {field}", self.collection),
        };
        let kind = match self.kind {
            MessageKind::Update => EventKind::Update {
                id: self.id.ok_or_else(|| missing("id"))?,
                data: self.payload.clone().ok_or_else(|| missing("payload"))?,
            },
            MessageKind::Removal => EventKind::Removal {
                id: self.id.ok_or_else(|| missing("id"))?,
            },
            MessageKind::Clear => EventKind::Clear,
        };
        Ok(InvalidationEvent {
            collection: self.collection,
            kind,
        })
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => hex::decode(s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
