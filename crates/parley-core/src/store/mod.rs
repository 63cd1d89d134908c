//! Message persistence.

mod database;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::message::Message;

pub use database::LibSqlMessageStore;

/// Errors that can occur while storing messages.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The message can never be stored (missing id, timestamp or users)
    #[error("Invalid message: {0}")]
    Invalid(String),

    /// A message with this id is already stored
    #[error("Message already stored: {0}")]
    Duplicate(Uuid),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Trait for message storage backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist one message.
    ///
    /// Storing an id that is already present returns
    /// [`StoreError::Duplicate`] and leaves the stored row untouched.
    async fn store(&self, message: &Message) -> Result<(), StoreError>;
}

/// Check that a message carries everything a stored row requires.
pub fn validate(message: &Message) -> Result<(), StoreError> {
    if message.id.is_nil() {
        return Err(StoreError::Invalid("missing id".into()));
    }
    if !message.is_delivery_ready() {
        return Err(StoreError::Invalid("missing created_at".into()));
    }
    if message.sender_id.is_nil() || message.recipient_id.is_nil() {
        return Err(StoreError::Invalid("nil user id".into()));
    }
    Ok(())
}
