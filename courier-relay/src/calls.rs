//! Call session registry.
//!
//! Calls start `ringing` and only move forward:
//! ```text
//! ringing ──► active ──► ended
//!    └──────────────────► ended
//! ```
//! Under `TransitionPolicy::Permissive` any status may be set. Setting the
//! current status again always succeeds without change.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::TransitionPolicy;
use crate::error::RelayError;
use crate::model::{now_millis, CallSession, CallStatus, NewCall};

#[derive(Default)]
struct CallState {
    calls: HashMap<Uuid, CallSession>,
    /// conversation id → call ids in start order
    by_conversation: HashMap<Uuid, Vec<Uuid>>,
}

pub struct CallRegistry {
    state: RwLock<CallState>,
    policy: TransitionPolicy,
}

impl CallRegistry {
    pub fn new(policy: TransitionPolicy) -> Self {
        Self {
            state: RwLock::new(CallState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Register a new call in the `ringing` state.
    pub async fn start_call(&self, new: NewCall) -> CallSession {
        let call = CallSession {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            kind: new.kind,
            status: CallStatus::Ringing,
            started_at: now_millis(),
            participants: new.participants,
        };

        let mut state = self.state.write().await;
        state
            .by_conversation
            .entry(call.conversation_id)
            .or_default()
            .push(call.id);
        state.calls.insert(call.id, call.clone());

        log::info!(
            "Call {} started in conversation {} ({} participants)",
            call.id,
            call.conversation_id,
            call.participants.len()
        );
        call
    }

    /// Move a call to `status`. The flag is false when the call already had
    /// that status and nothing changed.
    pub async fn update_status(
        &self,
        call_id: Uuid,
        status: CallStatus,
    ) -> Result<(CallSession, bool), RelayError> {
        let mut state = self.state.write().await;
        let call = state
            .calls
            .get_mut(&call_id)
            .ok_or_else(|| RelayError::call_not_found(call_id))?;

        if call.status == status {
            return Ok((call.clone(), false));
        }
        if !self.policy.allows(call.status, status) {
            log::debug!("Rejected call {call_id} transition {} -> {status}", call.status);
            return Err(RelayError::InvalidTransition {
                from: call.status,
                to: status,
            });
        }

        log::info!("Call {call_id}: {} -> {status}", call.status);
        call.status = status;
        Ok((call.clone(), true))
    }

    /// Calls of a conversation in start order.
    pub async fn list_calls(&self, conversation_id: Uuid) -> Vec<CallSession> {
        let state = self.state.read().await;
        state
            .by_conversation
            .get(&conversation_id)
            .map(|ids| ids.iter().filter_map(|id| state.calls.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn get_call(&self, call_id: Uuid) -> Result<CallSession, RelayError> {
        self.state
            .read()
            .await
            .calls
            .get(&call_id)
            .cloned()
            .ok_or_else(|| RelayError::call_not_found(call_id))
    }

    pub async fn exists(&self, call_id: Uuid) -> bool {
        self.state.read().await.calls.contains_key(&call_id)
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(TransitionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{CallKind, Member};
    use std::sync::Arc;

    fn new_call(conversation_id: Uuid) -> NewCall {
        NewCall {
            conversation_id,
            kind: CallKind::Video,
            participants: vec![Member::new("u1", "Alex"), Member::new("u2", "Jordan")],
        }
    }

    #[tokio::test]
    async fn test_start_call_ringing() {
        let registry = CallRegistry::default();
        let call = registry.start_call(new_call(Uuid::new_v4())).await;
        assert_eq!(call.status, CallStatus::Ringing);
        assert!(registry.exists(call.id).await);
        assert_eq!(registry.get_call(call.id).await.unwrap(), call);
    }

    #[tokio::test]
    async fn test_lifecycle_then_reject_backward() {
        let registry = CallRegistry::default();
        let call = registry.start_call(new_call(Uuid::new_v4())).await;

        let (active, changed) = registry.update_status(call.id, CallStatus::Active).await.unwrap();
        assert_eq!(active.status, CallStatus::Active);
        assert!(changed);
        let (ended, _) = registry.update_status(call.id, CallStatus::Ended).await.unwrap();
        assert_eq!(ended.status, CallStatus::Ended);

        let err = registry.update_status(call.id, CallStatus::Active).await.unwrap_err();
        assert_eq!(
            err,
            RelayError::InvalidTransition {
                from: CallStatus::Ended,
                to: CallStatus::Active
            }
        );
        assert_eq!(registry.get_call(call.id).await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let registry = CallRegistry::default();
        let call = registry.start_call(new_call(Uuid::new_v4())).await;
        registry.update_status(call.id, CallStatus::Ended).await.unwrap();
        let (again, changed) = registry.update_status(call.id, CallStatus::Ended).await.unwrap();
        assert_eq!(again.status, CallStatus::Ended);
        assert!(!changed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_status_changes_once() {
        let registry = Arc::new(CallRegistry::default());
        let call = registry.start_call(new_call(Uuid::new_v4())).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.update_status(call.id, CallStatus::Active).await.unwrap()
            }));
        }

        let mut changes = 0;
        for handle in handles {
            let (session, changed) = handle.await.unwrap();
            assert_eq!(session.status, CallStatus::Active);
            if changed {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn test_permissive_policy() {
        let registry = CallRegistry::new(TransitionPolicy::Permissive);
        let call = registry.start_call(new_call(Uuid::new_v4())).await;
        registry.update_status(call.id, CallStatus::Ended).await.unwrap();
        let (revived, _) = registry.update_status(call.id, CallStatus::Ringing).await.unwrap();
        assert_eq!(revived.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_unknown_call() {
        let registry = CallRegistry::default();
        let err = registry
            .update_status(Uuid::new_v4(), CallStatus::Active)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.get_call(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_calls_by_conversation() {
        let registry = CallRegistry::default();
        let conv = Uuid::new_v4();
        let first = registry.start_call(new_call(conv)).await;
        let _elsewhere = registry.start_call(new_call(Uuid::new_v4())).await;
        let second = registry.start_call(new_call(conv)).await;

        let ids: Vec<Uuid> = registry.list_calls(conv).await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(registry.list_calls(Uuid::new_v4()).await.is_empty());
    }
}
