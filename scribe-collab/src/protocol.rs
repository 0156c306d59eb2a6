//! Wire types for the realtime pipeline.
//!
//! Client frames are opaque byte sequences. Only the first byte is examined:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ tag      │ body                         │
//! │ 1 byte   │ variable                     │
//! └──────────┴──────────────────────────────┘
//! ```
//! Tag `3` marks the body as a full document snapshot that is eligible for
//! persistence. Every other tag passes through unexamined.
//!
//! Bus messages (bincode-encoded [`BusMessage`]) wrap a frame with the id of
//! the document it belongs to, so that another server instance can route it
//! into its own local room. The publishing instance stamps its own id as the
//! `origin` and ignores messages carrying it when they come back.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Type tag of a snapshot frame.
pub const SNAPSHOT_TAG: u8 = 3;

/// Prefix of every per-document bus topic.
pub const TOPIC_PREFIX: &str = "doc:";

/// Pattern matching every document topic.
pub const TOPIC_PATTERN: &str = "doc:*";

/// Whether `topic` is a per-document topic, i.e. one [`TOPIC_PATTERN`] matches.
pub fn is_document_topic(topic: &str) -> bool {
    topic.starts_with(TOPIC_PREFIX)
}

/// Opaque document identifier. Used as the room key and the bus topic suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bus topic for this document (`doc:<id>`).
    pub fn topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How the pipeline treats a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Tag 3 with a non-empty body: forwarded and persisted.
    Snapshot,
    /// Any other tag (or a bare snapshot tag): forwarded only.
    Opaque,
    /// Zero-length frame: forwarded only.
    Empty,
}

/// A client frame. Cheap to clone: fan-out shares one buffer across members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Type tag (first byte), if any.
    pub fn tag(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn kind(&self) -> FrameKind {
        match self.tag() {
            None => FrameKind::Empty,
            Some(SNAPSHOT_TAG) if self.0.len() > 1 => FrameKind::Snapshot,
            Some(_) => FrameKind::Opaque,
        }
    }

    /// Body of a snapshot frame (`bytes[1..]`), sharing the frame's buffer.
    pub fn snapshot_payload(&self) -> Option<Bytes> {
        match self.kind() {
            FrameKind::Snapshot => Some(self.0.slice(1..)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Frame {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// A frame addressed to a document, as carried by the fan-out bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub doc_id: DocumentId,
    /// Instance id of the publisher (empty when unknown).
    pub origin: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(doc_id: DocumentId, frame: &Frame) -> Self {
        Self::with_origin(doc_id, String::new(), frame)
    }

    pub fn with_origin(doc_id: DocumentId, origin: impl Into<String>, frame: &Frame) -> Self {
        Self {
            doc_id,
            origin: origin.into(),
            payload: frame.as_bytes().to_vec(),
        }
    }

    /// Whether this message was published by instance `instance_id`.
    pub fn is_from(&self, instance_id: &str) -> bool {
        !self.origin.is_empty() && self.origin == instance_id
    }

    pub fn frame(&self) -> Frame {
        Frame::from(self.payload.clone())
    }

    pub fn into_frame(self) -> Frame {
        Frame::from(self.payload)
    }

    /// Serialize to the bus wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the bus wire format. Messages without a document id
    /// are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if msg.doc_id.is_empty() {
            return Err(ProtocolError::MissingDocumentId);
        }
        Ok(msg)
    }
}

/// Bus message codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Bus message has no document id")]
    MissingDocumentId,
}
