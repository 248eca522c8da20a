//! In-process ledger used when no storage path is configured.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::{MessageLedger, StoreError};
use crate::model::{now_millis, Conversation, Message, NewConversation};

#[derive(Default)]
struct LedgerState {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    /// conversation id → (sent_at, message id), kept sorted.
    timelines: HashMap<Uuid, BTreeSet<(u64, Uuid)>>,
}

/// Ledger held entirely in memory. A single lock guards all state, which
/// trivially serializes mutations of the same message.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageLedger for MemoryLedger {
    fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            members: new.members,
            created_at: now_millis(),
        };
        let mut state = self.write();
        state.conversations.insert(conversation.id, conversation.clone());
        state.timelines.insert(conversation.id, BTreeSet::new());
        Ok(conversation)
    }

    fn get_conversation(&self, id: Uuid) -> Result<Conversation, StoreError> {
        self.read()
            .conversations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ConversationNotFound(id))
    }

    fn conversation_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.read().conversations.contains_key(&id))
    }

    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let mut found: Vec<Conversation> = self
            .read()
            .conversations
            .values()
            .filter(|c| c.has_member(user_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn delete_conversation(&self, id: Uuid) -> Result<usize, StoreError> {
        let mut state = self.write();
        if state.conversations.remove(&id).is_none() {
            return Err(StoreError::ConversationNotFound(id));
        }
        let timeline = state.timelines.remove(&id).unwrap_or_default();
        for (_, message_id) in &timeline {
            state.messages.remove(message_id);
        }
        Ok(timeline.len())
    }

    fn append_message(&self, message: &Message) -> Result<Message, StoreError> {
        let mut state = self.write();
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        }
        if let Some(existing) = state.messages.get(&message.id) {
            return Ok(existing.clone());
        }
        state.messages.insert(message.id, message.clone());
        state
            .timelines
            .entry(message.conversation_id)
            .or_default()
            .insert((message.sent_at, message.id));
        Ok(message.clone())
    }

    fn update_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError> {
        let mut state = self.write();
        match state.messages.get_mut(&message_id) {
            Some(message) if message.conversation_id == conversation_id => {
                message.body = body.to_string();
                Ok(message.clone())
            }
            _ => Err(StoreError::MessageNotFound(message_id)),
        }
    }

    fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, StoreError> {
        let mut state = self.write();
        let belongs = state
            .messages
            .get(&message_id)
            .is_some_and(|m| m.conversation_id == conversation_id);
        if !belongs {
            return Err(StoreError::MessageNotFound(message_id));
        }
        let removed = state
            .messages
            .remove(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if let Some(timeline) = state.timelines.get_mut(&conversation_id) {
            timeline.remove(&(removed.sent_at, removed.id));
        }
        Ok(removed)
    }

    fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let state = self.read();
        let timeline = state
            .timelines
            .get(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        Ok(timeline
            .iter()
            .filter_map(|(_, id)| state.messages.get(id).cloned())
            .collect())
    }
}
