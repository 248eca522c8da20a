//! Binary protocol between the relay gateway and its clients.
//!
//! Every WebSocket binary message carries one bincode-encoded frame:
//! ```text
//! client → server   ClientFrame::{Request, PresenceJoin, Typing, Ping}
//! server → client   ServerFrame::{Reply, Event, Pong}
//! ```
//!
//! Requests carry a client-chosen `request_id`; the matching `Reply` echoes
//! it. Replies may arrive out of order because a message submission waits on
//! the delivery queue while other requests complete.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorBody;
use crate::model::{
    CallSession, CallStatus, Conversation, DeliveryJob, Message, NewCall, NewConversation,
    SequencedSignal, SignalKind,
};
use crate::presence::{PresenceEntry, TypingNotice};

/// Notification fanned out to every connected observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayEvent {
    MessageCreated(Message),
    MessageUpdated(Message),
    MessageDeleted(Message),
    /// Full list of users currently online.
    PresenceUpdate(Vec<PresenceEntry>),
    Typing(TypingNotice),
    CallUpdated(CallSession),
    /// A signal was appended; peers fetch it with `ListSignals { since }`.
    SignalPosted {
        call_id: Uuid,
        kind: SignalKind,
        sequence: u64,
        sender_id: String,
    },
}

impl RelayEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::MessageCreated(_) => "message:created",
            RelayEvent::MessageUpdated(_) => "message:updated",
            RelayEvent::MessageDeleted(_) => "message:deleted",
            RelayEvent::PresenceUpdate(_) => "presence:update",
            RelayEvent::Typing(_) => "typing:update",
            RelayEvent::CallUpdated(_) => "call:updated",
            RelayEvent::SignalPosted { .. } => "signal:posted",
        }
    }
}

/// Operations a client may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CreateConversation(NewConversation),
    ListConversations { user_id: String },
    SubmitMessage(DeliveryJob),
    UpdateMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        body: String,
    },
    DeleteMessage {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    ListMessages { conversation_id: Uuid },
    StartCall(NewCall),
    UpdateCallStatus { call_id: Uuid, status: CallStatus },
    ListCalls { conversation_id: Uuid },
    PostSignal {
        call_id: Uuid,
        kind: SignalKind,
        sender_id: String,
        payload: Vec<u8>,
    },
    ListSignals {
        call_id: Uuid,
        kind: SignalKind,
        /// Only signals at or after this position; `None` lists the whole bucket.
        since: Option<u64>,
    },
}

/// Successful command results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Conversation(Conversation),
    Conversations(Vec<Conversation>),
    Message(Message),
    Messages(Vec<Message>),
    Call(CallSession),
    Calls(Vec<CallSession>),
    SignalPosted { sequence: u64 },
    Signals(Vec<SequencedSignal>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Request { request_id: u64, command: Command },
    PresenceJoin { user_id: String, display_name: String },
    Typing(TypingNotice),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Reply {
        request_id: u64,
        result: Result<Reply, ErrorBody>,
    },
    Event(RelayEvent),
    Pong,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

#[inline(always)]
fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

#[inline(always)]
fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(frame)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedFrame,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame => write!(f, "Unexpected frame"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
