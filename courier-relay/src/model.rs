//! Domain records shared by the ledger, the call registry and the wire protocol.
//!
//! All timestamps are milliseconds since the Unix epoch, assigned by the
//! server. Every record derives serde so it can travel inside bincode frames
//! and be stored as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Conversations & messages
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A participant as listed on a conversation or a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub display_name: String,
}

impl Member {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Input for creating a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub name: Option<String>,
    pub kind: ConversationKind,
    pub members: Vec<Member>,
}

impl NewConversation {
    pub fn direct(a: Member, b: Member) -> Self {
        Self {
            name: None,
            kind: ConversationKind::Direct,
            members: vec![a, b],
        }
    }

    pub fn group(name: impl Into<String>, members: Vec<Member>) -> Self {
        Self {
            name: Some(name.into()),
            kind: ConversationKind::Group,
            members,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: Option<String>,
    pub kind: ConversationKind,
    pub members: Vec<Member>,
    pub created_at: u64,
}

impl Conversation {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }
}

/// A committed message. Only a worker creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub body: String,
    pub sent_at: u64,
}

/// The unit of work handed to the delivery queue: "persist this message".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub body: String,
}

impl DeliveryJob {
    pub fn new(conversation_id: Uuid, sender_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id: sender_id.into(),
            body: body.into(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Calls
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Audio,
    Video,
}

/// Call status. Declaration order is lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

impl CallStatus {
    /// Whether moving from `self` to `next` goes forward through
    /// ringing → active → ended (skipping `active` is allowed).
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        self == next || (self != CallStatus::Ended && next > self)
    }

    pub fn is_terminal(self) -> bool {
        self == CallStatus::Ended
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::Active => write!(f, "active"),
            CallStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Input for starting a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCall {
    pub conversation_id: Uuid,
    pub kind: CallKind,
    pub participants: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: u64,
    pub participants: Vec<Member>,
}

// ───────────────────────────────────────────────────────────────────
// Signaling
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Offer, SignalKind::Answer, SignalKind::Ice];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::Ice => write!(f, "ice"),
        }
    }
}

/// One unit of WebRTC negotiation data. The payload is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub sender_id: String,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

impl Signal {
    pub fn new(sender_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload: payload.into(),
            created_at: now_millis(),
        }
    }
}

/// A signal together with its position in its (call, kind) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedSignal {
    pub sequence: u64,
    pub signal: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_forward_transitions() {
        use CallStatus::*;
        assert!(Ringing.can_transition_to(Active));
        assert!(Ringing.can_transition_to(Ended));
        assert!(Active.can_transition_to(Ended));
        assert!(Active.can_transition_to(Active));
    }

    #[test]
    fn test_call_status_rejects_backward() {
        use CallStatus::*;
        assert!(!Active.can_transition_to(Ringing));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Ended.can_transition_to(Ringing));
        assert!(Ended.is_terminal());
    }

    #[test]
    fn test_conversation_membership() {
        let conv = Conversation {
            id: Uuid::new_v4(),
            name: None,
            kind: ConversationKind::Direct,
            members: vec![Member::new("u1", "Alex"), Member::new("u2", "Jordan")],
            created_at: now_millis(),
        };
        assert!(conv.has_member("u1"));
        assert!(!conv.has_member("u3"));
    }

    #[test]
    fn test_signal_kind_display() {
        let names: Vec<String> = SignalKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["offer", "answer", "ice"]);
    }
}
