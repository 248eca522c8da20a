//! Message ledger: the single source of truth for conversations and messages.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append (idempotent)  ┌──────────────────────────────────┐
//! │ Worker      │ ────────────────────► │ MessageLedger                    │
//! └─────────────┘                       │                                  │
//! ┌─────────────┐  update / delete      │  MemoryLedger  (no storage path) │
//! │ Relay       │ ────────────────────► │  RocksLedger   (column families) │
//! └─────────────┘  list (sent_at order) └──────────────────────────────────┘
//! ```
//!
//! RocksDB column families:
//! - `conversations` — bincode Conversation, keyed by conversation id
//! - `messages`      — LZ4-compressed bincode Message, keyed by message id
//! - `timeline`      — empty values keyed by `conv_id ‖ sent_at BE ‖ msg_id`
//!
//! Mutations of one message are serialized through striped locks; different
//! messages proceed independently.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLedger;
pub use rocks::{RocksLedger, StoreConfig};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::RelayError;
use crate::model::{Conversation, Message, NewConversation};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Conversation does not exist
    ConversationNotFound(Uuid),
    /// Message does not exist (or belongs to another conversation)
    MessageNotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::ConversationNotFound(id) => write!(f, "Conversation not found: {id}"),
            StoreError::MessageNotFound(id) => write!(f, "Message not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable store of conversations and their messages.
///
/// Implementations must make `append_message` insert-if-absent by message
/// id: a redelivered job carries the same id and must not create a second
/// record.
pub trait MessageLedger: Send + Sync {
    fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    fn get_conversation(&self, id: Uuid) -> Result<Conversation, StoreError>;

    fn conversation_exists(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Conversations the user belongs to, newest first.
    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Remove a conversation and all of its messages. Returns the number of
    /// messages removed.
    fn delete_conversation(&self, id: Uuid) -> Result<usize, StoreError>;

    /// Commit a message. Returns the stored record, which is the existing
    /// one if a message with the same id was already committed.
    fn append_message(&self, message: &Message) -> Result<Message, StoreError>;

    fn update_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError>;

    /// Delete a message, returning the removed record.
    fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, StoreError>;

    /// Messages of a conversation in non-decreasing `sent_at` order.
    fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
}

/// Fixed set of mutexes indexed by message id.
pub(crate) struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

impl LockStripes {
    pub(crate) fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, id: &Uuid) -> MutexGuard<'_, ()> {
        let idx = (id.as_u128() % self.stripes.len() as u128) as usize;
        self.stripes[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a ledger call on the blocking pool. A panicked or cancelled call is
/// reported as a storage failure.
pub(crate) async fn with_ledger<T, F>(
    ledger: &Arc<dyn MessageLedger>,
    f: F,
) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: FnOnce(&dyn MessageLedger) -> Result<T, StoreError> + Send + 'static,
{
    let ledger = ledger.clone();
    tokio::task::spawn_blocking(move || f(ledger.as_ref()))
        .await
        .map_err(|e| RelayError::Storage(format!("ledger task failed: {e}")))?
        .map_err(RelayError::from)
}

pub(crate) fn encode_record<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}
