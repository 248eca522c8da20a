//! Delivery workers: the consuming side of the queue.
//!
//! For each job a worker:
//! 1. rejects an empty body or an unknown conversation (`Validation`, no retry)
//! 2. assigns the message id and `sent_at` (or reuses them on redelivery)
//! 3. appends to the ledger (insert-if-absent by message id)
//! 4. resolves the job with the committed message and announces it
//!
//! Storage failures are retried by requeueing with exponential backoff
//! until `max_attempts` deliveries have been made; then the last error is
//! handed to the submitter unchanged. Logs never include message bodies.

use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{DeliveryJob, Message};
use crate::protocol::RelayEvent;
use crate::queue::{DeliveryQueue, QueuedJob};
use crate::storage::{with_ledger, MessageLedger};

pub struct Worker {
    id: usize,
    ledger: Arc<dyn MessageLedger>,
    queue: Arc<DeliveryQueue>,
    config: RelayConfig,
    /// Told about every committed message
    broadcaster: Option<Arc<Broadcaster>>,
}

impl Worker {
    pub fn new(
        id: usize,
        ledger: Arc<dyn MessageLedger>,
        queue: Arc<DeliveryQueue>,
        config: RelayConfig,
    ) -> Self {
        Self {
            id,
            ledger,
            queue,
            config,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Process jobs until the queue shuts down.
    pub async fn run(self) {
        log::debug!("Worker {} started", self.id);
        while let Some(queued) = self.queue.next_job().await {
            self.process(queued).await;
        }
        log::debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, mut queued: QueuedJob) {
        let token = queued.token;
        let attempt = queued.attempt;
        let conversation_id = queued.job.conversation_id;

        let result = match self.validate(&queued.job).await {
            Ok(()) => {
                let message = Message {
                    id: *queued.message_id.get_or_insert_with(Uuid::new_v4),
                    conversation_id,
                    sender_id: queued.job.sender_id.clone(),
                    body: queued.job.body.clone(),
                    sent_at: *queued
                        .sent_at
                        .get_or_insert_with(|| self.queue.next_sent_at()),
                };
                self.commit(message).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(message) => {
                if attempt > 1 {
                    log::info!(
                        "Worker {}: {token} committed message {} after {attempt} attempts",
                        self.id,
                        message.id
                    );
                } else {
                    log::debug!(
                        "Worker {}: {token} committed message {} in conversation {conversation_id}",
                        self.id,
                        message.id
                    );
                }
                if let Some(broadcaster) = &self.broadcaster {
                    broadcaster.publish(RelayEvent::MessageCreated(message.clone()));
                }
                self.queue.resolve(token, Ok(message));
            }
            Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                let backoff = self.config.retry_backoff(attempt);
                log::warn!(
                    "Worker {}: {token} for conversation {conversation_id} from {} failed \
                     (attempt {attempt}/{}), retrying in {backoff:?}: {err}",
                    self.id,
                    queued.job.sender_id,
                    self.config.max_attempts
                );
                self.queue.requeue(queued, backoff);
            }
            Err(err) => {
                if err.is_transient() {
                    log::error!(
                        "Worker {}: {token} for conversation {conversation_id} from {} failed \
                         after {attempt} attempts: {err}",
                        self.id,
                        queued.job.sender_id
                    );
                } else {
                    log::warn!(
                        "Worker {}: {token} for conversation {conversation_id} from {} rejected: {err}",
                        self.id,
                        queued.job.sender_id
                    );
                }
                self.queue.resolve(token, Err(err));
            }
        }
    }

    async fn validate(&self, job: &DeliveryJob) -> Result<(), RelayError> {
        if job.body.trim().is_empty() {
            return Err(RelayError::Validation("message body is empty".into()));
        }
        let conversation_id = job.conversation_id;
        let exists = with_ledger(&self.ledger, move |ledger| {
            ledger.conversation_exists(conversation_id)
        })
        .await?;
        if !exists {
            return Err(RelayError::Validation(format!(
                "conversation {conversation_id} not found"
            )));
        }
        Ok(())
    }

    async fn commit(&self, message: Message) -> Result<Message, RelayError> {
        with_ledger(&self.ledger, move |ledger| ledger.append_message(&message))
            .await
            .map_err(|err| match err {
                // Removed between validation and append
                RelayError::NotFound(what) => RelayError::Validation(what),
                other => other,
            })
    }
}
