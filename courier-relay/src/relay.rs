//! The relay: one handle over every store, the delivery pipeline and fan-out.
//!
//! ```text
//!                       ┌──────────────── Relay ────────────────┐
//! submit_message ─────► │ DeliveryQueue ─► Worker × N ─► Ledger │──► MessageCreated
//! update/delete ──────► │ Ledger ───────────────────────────────│──► MessageUpdated/Deleted
//! start/update call ──► │ CallRegistry ─────────────────────────│──► CallUpdated
//! append_signal ──────► │ SignalStore ──────────────────────────│──► SignalPosted
//! presence/typing ────► │ PresenceTracker ──────────────────────│──► PresenceUpdate/Typing
//!                       └───────────────────────────────────────┘
//!                                        │
//!                                   Broadcaster ──► observers
//! ```
//!
//! `Relay::open` must run inside a tokio runtime because it spawns the
//! delivery workers. `Relay::shutdown` stops them and fails any job that
//! never resolved.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, Broadcaster, ObserverInfo, Subscription};
use crate::calls::CallRegistry;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{
    CallSession, CallStatus, Conversation, DeliveryJob, Message, NewCall, NewConversation,
    SequencedSignal, Signal, SignalKind,
};
use crate::presence::{PresenceEntry, PresenceTracker, TypingNotice};
use crate::protocol::RelayEvent;
use crate::queue::{DeliveryQueue, JobState, JobToken, QueueStats};
use crate::signals::SignalStore;
use crate::storage::{with_ledger, MemoryLedger, MessageLedger, RocksLedger};
use crate::worker::Worker;

pub struct Relay {
    config: RelayConfig,
    ledger: Arc<dyn MessageLedger>,
    queue: Arc<DeliveryQueue>,
    calls: CallRegistry,
    signals: SignalStore,
    broadcaster: Arc<Broadcaster>,
    presence: tokio::sync::Mutex<PresenceTracker>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Open the configured ledger and start the workers.
    pub fn open(config: RelayConfig) -> Result<Self, RelayError> {
        let ledger: Arc<dyn MessageLedger> = match &config.storage {
            Some(store_config) => Arc::new(RocksLedger::open(store_config.clone())?),
            None => {
                log::info!("No storage configured, using in-memory ledger");
                Arc::new(MemoryLedger::new())
            }
        };
        Ok(Self::with_ledger(config, ledger))
    }

    /// Start a relay over an existing ledger.
    pub fn with_ledger(config: RelayConfig, ledger: Arc<dyn MessageLedger>) -> Self {
        let queue = Arc::new(DeliveryQueue::new(
            config.queue_capacity,
            config.submit_timeout(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast_capacity));

        let workers = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = Worker::new(id, ledger.clone(), queue.clone(), config.clone())
                    .with_broadcaster(broadcaster.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        log::info!(
            "Relay started with {} workers (max {} attempts, {:?} submit timeout)",
            config.worker_count.max(1),
            config.max_attempts,
            config.submit_timeout()
        );

        Self {
            calls: CallRegistry::new(config.transition_policy),
            signals: SignalStore::new(),
            presence: tokio::sync::Mutex::new(PresenceTracker::with_interval(
                config.typing_throttle(),
            )),
            workers: Mutex::new(workers),
            ledger,
            queue,
            broadcaster,
            config,
        }
    }

    /// Stop the workers and fail every unresolved job.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Worker task failed: {e}");
            }
        }
        let abandoned = self.queue.abandon_pending();
        if abandoned > 0 {
            log::warn!("Shutdown abandoned {abandoned} undelivered jobs");
        }
        log::info!("Relay shut down");
    }

    // ─── Conversations ────────────────────────────────────────────────

    pub async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, RelayError> {
        if new.members.is_empty() {
            return Err(RelayError::Validation("conversation needs at least one member".into()));
        }
        let conversation = with_ledger(&self.ledger, move |l| l.create_conversation(new)).await?;
        log::info!(
            "Created {:?} conversation {} with {} members",
            conversation.kind,
            conversation.id,
            conversation.members.len()
        );
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation, RelayError> {
        with_ledger(&self.ledger, move |l| l.get_conversation(id)).await
    }

    /// Conversations the user belongs to, newest first.
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RelayError> {
        let user_id = user_id.to_string();
        with_ledger(&self.ledger, move |l| l.list_conversations_for_user(&user_id)).await
    }

    /// Remove a conversation and its messages. Returns the number of
    /// messages removed.
    pub async fn delete_conversation(&self, id: Uuid) -> Result<usize, RelayError> {
        with_ledger(&self.ledger, move |l| l.delete_conversation(id)).await
    }

    // ─── Messages ─────────────────────────────────────────────────────

    /// Queue a message and wait for it to be committed.
    pub async fn submit_message(&self, job: DeliveryJob) -> Result<Message, RelayError> {
        self.queue.submit(job).await
    }

    /// Queue a message without waiting. Use `wait_message` or
    /// `poll_message` with the returned token.
    pub async fn enqueue_message(&self, job: DeliveryJob) -> Result<JobToken, RelayError> {
        self.queue.enqueue(job).await
    }

    pub async fn wait_message(&self, token: JobToken) -> Result<Message, RelayError> {
        self.queue.wait(token).await
    }

    pub fn poll_message(&self, token: JobToken) -> Result<JobState, RelayError> {
        self.queue.poll(token)
    }

    pub async fn update_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        body: &str,
    ) -> Result<Message, RelayError> {
        if body.trim().is_empty() {
            return Err(RelayError::Validation("message body is empty".into()));
        }
        let body = body.to_string();
        let message = with_ledger(&self.ledger, move |l| {
            l.update_message(conversation_id, message_id, &body)
        })
        .await?;
        self.broadcaster
            .publish(RelayEvent::MessageUpdated(message.clone()));
        Ok(message)
    }

    /// Delete a message, returning the removed record.
    pub async fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, RelayError> {
        let message = with_ledger(&self.ledger, move |l| {
            l.delete_message(conversation_id, message_id)
        })
        .await?;
        self.broadcaster
            .publish(RelayEvent::MessageDeleted(message.clone()));
        Ok(message)
    }

    /// Messages of a conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, RelayError> {
        with_ledger(&self.ledger, move |l| l.list_messages(conversation_id)).await
    }

    // ─── Calls ────────────────────────────────────────────────────────

    pub async fn start_call(&self, new: NewCall) -> Result<CallSession, RelayError> {
        if self.config.require_call_conversation {
            let conversation_id = new.conversation_id;
            let exists =
                with_ledger(&self.ledger, move |l| l.conversation_exists(conversation_id)).await?;
            if !exists {
                return Err(RelayError::Validation(format!(
                    "conversation {conversation_id} not found"
                )));
            }
        }
        let call = self.calls.start_call(new).await;
        self.broadcaster.publish(RelayEvent::CallUpdated(call.clone()));
        Ok(call)
    }

    pub async fn update_call_status(&self, call_id: Uuid, status: CallStatus) -> Result<CallSession, RelayError> {
        let (call, changed) = self.calls.update_status(call_id, status).await?;
        if changed {
            self.broadcaster.publish(RelayEvent::CallUpdated(call.clone()));
        }
        Ok(call)
    }

    pub async fn get_call(&self, call_id: Uuid) -> Result<CallSession, RelayError> {
        self.calls.get_call(call_id).await
    }

    /// Calls of a conversation in start order.
    pub async fn list_calls(&self, conversation_id: Uuid) -> Vec<CallSession> {
        self.calls.list_calls(conversation_id).await
    }

    // ─── Signaling ────────────────────────────────────────────────────

    /// Store a signal for a known call and announce it. Returns its sequence.
    pub async fn append_signal(
        &self,
        call_id: Uuid,
        kind: SignalKind,
        sender_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, RelayError> {
        self.ensure_call(call_id).await?;
        let sequence = self
            .signals
            .append(call_id, kind, Signal::new(sender_id, payload))
            .await;
        log::debug!("Call {call_id}: {kind} #{sequence} from {sender_id}");
        self.broadcaster.publish(RelayEvent::SignalPosted {
            call_id,
            kind,
            sequence,
            sender_id: sender_id.to_string(),
        });
        Ok(sequence)
    }

    pub async fn list_signals(&self, call_id: Uuid, kind: SignalKind) -> Result<Vec<Signal>, RelayError> {
        self.ensure_call(call_id).await?;
        Ok(self.signals.list(call_id, kind).await)
    }

    pub async fn list_signals_since(
        &self,
        call_id: Uuid,
        kind: SignalKind,
        since: u64,
    ) -> Result<Vec<SequencedSignal>, RelayError> {
        self.ensure_call(call_id).await?;
        Ok(self.signals.list_since(call_id, kind, since).await)
    }

    async fn ensure_call(&self, call_id: Uuid) -> Result<(), RelayError> {
        if self.calls.exists(call_id).await {
            Ok(())
        } else {
            Err(RelayError::call_not_found(call_id))
        }
    }

    // ─── Observers, presence and typing ───────────────────────────────

    pub async fn connect_observer(&self, label: impl Into<String>) -> Subscription {
        self.broadcaster.connect(ObserverInfo::new(label)).await
    }

    /// Drop an observer, announcing the new online list if it had joined.
    pub async fn disconnect_observer(&self, observer_id: Uuid) {
        self.broadcaster.disconnect(&observer_id).await;
        let online = {
            let mut presence = self.presence.lock().await;
            presence.leave(&observer_id).map(|entry| {
                log::info!("{} ({}) went offline", entry.display_name, entry.user_id);
                presence.online()
            })
        };
        if let Some(online) = online {
            self.broadcaster.publish(RelayEvent::PresenceUpdate(online));
        }
    }

    /// Mark an observer as a user and announce the full online list.
    pub async fn presence_join(&self, observer_id: Uuid, user_id: &str, display_name: &str) -> Vec<PresenceEntry> {
        let online = {
            let mut presence = self.presence.lock().await;
            presence.join(observer_id, user_id, display_name);
            presence.online()
        };
        log::info!("{display_name} ({user_id}) is online");
        self.broadcaster
            .publish(RelayEvent::PresenceUpdate(online.clone()));
        online
    }

    pub async fn online_users(&self) -> Vec<PresenceEntry> {
        self.presence.lock().await.online()
    }

    /// Relay a typing notice to every observer except the sender. Returns
    /// false when the notice was throttled.
    pub async fn typing(&self, observer_id: Uuid, notice: TypingNotice) -> bool {
        let relay = self.presence.lock().await.should_relay_typing(&notice);
        if relay {
            log::trace!(
                "{} typing={} in {}",
                notice.user_id,
                notice.is_typing,
                notice.conversation_id
            );
            self.broadcaster
                .publish_from(observer_id, RelayEvent::Typing(notice));
        }
        relay
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats().await
    }
}
