//! Relay-level error taxonomy.
//!
//! `NotFound`, `Validation` and `InvalidTransition` are permanent and are
//! surfaced to the caller immediately. `Storage` and `Queue` are transient:
//! the delivery worker retries them a bounded number of times before the
//! last error reaches the submitter unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::CallStatus;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Wire-level error category, carried inside reply frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Queue,
    InvalidTransition,
    Storage,
    Protocol,
}

/// Serializable error as sent to remote clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Unknown conversation, message or call.
    NotFound(String),
    /// Input that can never succeed (unknown conversation on submit, empty body).
    Validation(String),
    /// Queue closed, job abandoned, or the wait for a job timed out.
    Queue(String),
    /// Non-monotonic call status change.
    InvalidTransition { from: CallStatus, to: CallStatus },
    /// Storage engine failure.
    Storage(String),
    /// Malformed frame on the wire.
    Protocol(String),
}

impl RelayError {
    pub fn conversation_not_found(id: Uuid) -> Self {
        RelayError::NotFound(format!("conversation {id} not found"))
    }

    pub fn message_not_found(id: Uuid) -> Self {
        RelayError::NotFound(format!("message {id} not found"))
    }

    pub fn call_not_found(id: Uuid) -> Self {
        RelayError::NotFound(format!("call {id} not found"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NotFound(_) => ErrorKind::NotFound,
            RelayError::Validation(_) => ErrorKind::Validation,
            RelayError::Queue(_) => ErrorKind::Queue,
            RelayError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            RelayError::Storage(_) => ErrorKind::Storage,
            RelayError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Storage(_) | RelayError::Queue(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::NotFound(what) => write!(f, "Not found: {what}"),
            RelayError::Validation(e) => write!(f, "Validation error: {e}"),
            RelayError::Queue(e) => write!(f, "Queue error: {e}"),
            RelayError::InvalidTransition { from, to } => {
                write!(f, "Invalid call transition: {from} -> {to}")
            }
            RelayError::Storage(e) => write!(f, "Storage error: {e}"),
            RelayError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound(id) => RelayError::conversation_not_found(id),
            StoreError::MessageNotFound(id) => RelayError::message_not_found(id),
            other => RelayError::Storage(other.to_string()),
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::Protocol(e.to_string())
    }
}
