//! Message domain types and wire codec.
//!
//! The same JSON shape travels over the client transport and through the
//! durable log:
//!
//! ```json
//! {"id": "...", "sender_id": "...", "recipient_id": "...", "content": "...", "created_at": "RFC3339"}
//! ```
//!
//! `id` and `created_at` may be absent (or empty/zero) on the way in; the
//! router fills them before the message enters the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while decoding or encoding a wire message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed message ({size} bytes): {source}")]
    Malformed {
        size: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stable identifier of a chat user; also the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a random user id (tests and tooling).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id; nil until the router assigns one
    #[serde(default, deserialize_with = "lenient_uuid")]
    pub id: Uuid,
    /// Sending user
    pub sender_id: UserId,
    /// Receiving user
    pub recipient_id: UserId,
    /// Message text
    pub content: String,
    /// Creation time; `None` until the router stamps it
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create an unadmitted message with neither id nor timestamp.
    pub fn new(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::nil(),
            sender_id,
            recipient_id,
            content: content.into(),
            created_at: None,
        }
    }

    /// Decode a message from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|source| CodecError::Malformed {
            size: bytes.len(),
            source,
        })
    }

    /// Encode the message to its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Encode the message as a JSON string (for text frames).
    pub fn encode_text(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Fill in the id and creation time if they are unset.
    ///
    /// Values that are already set are never touched, so calling this more
    /// than once is a no-op after the first call.
    pub fn prepare_for_delivery(mut self, now: DateTime<Utc>) -> Self {
        if self.id.is_nil() {
            self.id = Uuid::now_v7();
        }
        if !self.has_timestamp() {
            self.created_at = Some(now);
        }
        self
    }

    /// Whether both the id and the creation time are set.
    pub fn is_delivery_ready(&self) -> bool {
        !self.id.is_nil() && self.has_timestamp()
    }

    fn has_timestamp(&self) -> bool {
        self.created_at.is_some_and(|ts| !is_zero_timestamp(&ts))
    }
}

/// The zero timestamp some clients send (`0001-01-01T00:00:00Z`) means "unset".
pub fn is_zero_timestamp(ts: &DateTime<Utc>) -> bool {
    ts.year() <= 1
}

fn lenient_uuid<'de, D>(deserializer: D) -> Result<Uuid, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(Uuid::nil()),
        Some(s) => Uuid::parse_str(s).map_err(serde::de::Error::custom),
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => {
            let ts = DateTime::parse_from_rfc3339(s)
                .map_err(serde::de::Error::custom)?
                .with_timezone(&Utc);
            Ok((!is_zero_timestamp(&ts)).then_some(ts))
        }
    }
}
