//! Presence and typing awareness.
//!
//! ```text
//! PresenceJoin ──► PresenceTracker::join() ──► PresenceUpdate(full online list)
//! disconnect   ──► PresenceTracker::leave() ─► PresenceUpdate (if it was online)
//! Typing       ──► should_relay_typing() ───► Typing notice to every other observer
//!                  (start notices throttled per user and conversation)
//! ```
//!
//! Presence is ephemeral. Nothing here is persisted and a restart starts
//! with nobody online.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One online observer and the user it speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub observer_id: Uuid,
    pub user_id: String,
    pub display_name: String,
}

/// A user started or stopped typing in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub is_typing: bool,
}

impl TypingNotice {
    pub fn started(conversation_id: Uuid, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
            is_typing: true,
        }
    }

    pub fn stopped(conversation_id: Uuid, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            is_typing: false,
            ..Self::started(conversation_id, user_id, display_name)
        }
    }
}

/// Tracks who is online and rate-limits typing notices.
pub struct PresenceTracker {
    /// Online users, indexed by observer id.
    online: HashMap<Uuid, PresenceEntry>,
    /// Last relayed "started typing" per (conversation, user).
    last_typing: HashMap<(Uuid, String), Instant>,
    /// Minimum interval between relayed start notices (default 500ms).
    typing_interval: Duration,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(500))
    }

    /// Create with a custom typing throttle interval.
    pub fn with_interval(typing_interval: Duration) -> Self {
        Self {
            online: HashMap::new(),
            last_typing: HashMap::new(),
            typing_interval,
        }
    }

    /// Register an observer as a user. Joining again replaces the previous
    /// identity of that observer.
    pub fn join(&mut self, observer_id: Uuid, user_id: impl Into<String>, display_name: impl Into<String>) {
        let entry = PresenceEntry {
            observer_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
        };
        log::debug!("Observer {observer_id} online as {}", entry.user_id);
        self.online.insert(observer_id, entry);
    }

    /// Remove an observer. Returns its entry if it had joined.
    pub fn leave(&mut self, observer_id: &Uuid) -> Option<PresenceEntry> {
        let entry = self.online.remove(observer_id)?;
        // Forget throttle state once the user has no observer left
        if !self.online.values().any(|e| e.user_id == entry.user_id) {
            self.last_typing.retain(|(_, user), _| *user != entry.user_id);
        }
        Some(entry)
    }

    /// Everyone online, ordered by user id then observer id.
    pub fn online(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.online.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then_with(|| a.observer_id.cmp(&b.observer_id))
        });
        entries
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.values().any(|e| e.user_id == user_id)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Decide whether a typing notice should be fanned out.
    ///
    /// Stop notices always pass and reset the throttle. Start notices pass at
    /// most once per interval for the same user and conversation.
    pub fn should_relay_typing(&mut self, notice: &TypingNotice) -> bool {
        self.should_relay_typing_at(notice, Instant::now())
    }

    fn should_relay_typing_at(&mut self, notice: &TypingNotice, now: Instant) -> bool {
        let key = (notice.conversation_id, notice.user_id.clone());
        if !notice.is_typing {
            self.last_typing.remove(&key);
            return true;
        }
        match self.last_typing.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < self.typing_interval => false,
            _ => {
                self.last_typing.insert(key, now);
                true
            }
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
