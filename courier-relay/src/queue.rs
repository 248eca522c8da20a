//! Delivery queue: decouples accepting a message from persisting it.
//!
//! ```text
//! submit ─► enqueue ─► [bounded mpsc] ─► Worker::next_job ─► ledger
//!   │          │                              │
//!   │          └─ JobToken ─► watch<JobState> ◄┘ resolve / requeue
//!   └─ wait(token) ─────────────┘  (bounded by submit_timeout)
//! ```
//!
//! Workers share one receiver behind an async mutex, so each queued job is
//! handed to exactly one worker. A job that fails transiently is requeued
//! with the message id and timestamp it was first given, which keeps
//! redelivery from ever creating a second message.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::RelayError;
use crate::model::{now_millis, DeliveryJob, Message};

/// Handle returned by `enqueue`, used to wait for or poll a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobToken(Uuid);

impl JobToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Completed(Message),
    Failed(RelayError),
}

impl JobState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, JobState::Pending)
    }

    fn into_result(self) -> Option<Result<Message, RelayError>> {
        match self {
            JobState::Pending => None,
            JobState::Completed(message) => Some(Ok(message)),
            JobState::Failed(err) => Some(Err(err)),
        }
    }
}

/// A job as it travels through the channel.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub token: JobToken,
    pub job: DeliveryJob,
    /// Deliveries so far, including the one in progress.
    pub attempt: u32,
    /// Assigned on first dequeue and kept across redeliveries.
    pub message_id: Option<Uuid>,
    pub sent_at: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub pending: usize,
}

#[derive(Default)]
struct AtomicQueueStats {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

type PendingJobs = Arc<Mutex<HashMap<JobToken, watch::Sender<JobState>>>>;

pub struct DeliveryQueue {
    sender: mpsc::Sender<QueuedJob>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>,
    pending: PendingJobs,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    submit_timeout: Duration,
    stats: Arc<AtomicQueueStats>,
    /// Last `sent_at` handed out
    last_stamp: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, submit_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            shutdown,
            submit_timeout,
            stats: Arc::new(AtomicQueueStats::default()),
            last_stamp: AtomicU64::new(0),
        }
    }

    // ─── Producer side ────────────────────────────────────────────────

    /// Hand a job to the queue. Waits for capacity if the queue is full.
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<JobToken, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Queue("queue closed".into()));
        }

        let token = JobToken::new();
        let (state_tx, _) = watch::channel(JobState::Pending);
        lock_pending(&self.pending).insert(token, state_tx);

        let queued = QueuedJob {
            token,
            job,
            attempt: 0,
            message_id: None,
            sent_at: None,
        };
        if self.sender.send(queued).await.is_err() {
            lock_pending(&self.pending).remove(&token);
            return Err(RelayError::Queue("queue closed".into()));
        }

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        log::trace!("Enqueued {token}");
        Ok(token)
    }

    /// Wait until the job resolves, at most `submit_timeout`. A resolved job
    /// is reported once and then forgotten.
    pub async fn wait(&self, token: JobToken) -> Result<Message, RelayError> {
        let mut state_rx = lock_pending(&self.pending)
            .get(&token)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| RelayError::Queue(format!("unknown {token}")))?;

        // Clone out of the watch guard before touching the pending map
        let outcome = tokio::time::timeout(
            self.submit_timeout,
            state_rx.wait_for(JobState::is_resolved),
        )
        .await
        .map(|waited| waited.map(|state| (*state).clone()));
        lock_pending(&self.pending).remove(&token);

        match outcome {
            Ok(Ok(state)) => state
                .into_result()
                .unwrap_or_else(|| Err(RelayError::Queue(format!("{token} unresolved")))),
            Ok(Err(_)) => Err(RelayError::Queue(format!("{token} abandoned"))),
            Err(_) => {
                log::warn!("Timed out after {:?} waiting for {token}", self.submit_timeout);
                Err(RelayError::Queue(format!("timed out waiting for {token}")))
            }
        }
    }

    /// Current state without waiting. A resolved job is reported once and
    /// then forgotten.
    pub fn poll(&self, token: JobToken) -> Result<JobState, RelayError> {
        let mut pending = lock_pending(&self.pending);
        let state = pending
            .get(&token)
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| RelayError::Queue(format!("unknown {token}")))?;
        if state.is_resolved() {
            pending.remove(&token);
        }
        Ok(state)
    }

    /// Enqueue and wait for the committed message.
    pub async fn submit(&self, job: DeliveryJob) -> Result<Message, RelayError> {
        let token = self.enqueue(job).await?;
        self.wait(token).await
    }

    // ─── Consumer side ────────────────────────────────────────────────

    /// Next job for a worker. `None` once the queue is shut down.
    pub async fn next_job(&self) -> Option<QueuedJob> {
        let mut shutdown = self.shutdown.subscribe();
        let mut receiver = tokio::select! {
            guard = self.receiver.lock() => guard,
            _ = shutdown.wait_for(|closed| *closed) => return None,
        };
        let mut job = tokio::select! {
            job = receiver.recv() => job?,
            _ = shutdown.wait_for(|closed| *closed) => return None,
        };
        job.attempt += 1;
        Some(job)
    }

    /// Server timestamp for a new message: wall-clock milliseconds, bumped
    /// so that every stamp is strictly greater than the previous one.
    pub fn next_sent_at(&self) -> u64 {
        let now = now_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    /// Record the outcome of a job and wake its waiter.
    pub fn resolve(&self, token: JobToken, result: Result<Message, RelayError>) {
        resolve_pending(&self.pending, &self.stats, token, result);
    }

    /// Put a job back after `backoff`. The worker is free immediately.
    pub fn requeue(&self, job: QueuedJob, backoff: Duration) {
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        let sender = self.sender.clone();
        let pending = self.pending.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let token = job.token;
            if sender.send(job).await.is_err() {
                resolve_pending(
                    &pending,
                    &stats,
                    token,
                    Err(RelayError::Queue("queue closed".into())),
                );
            }
        });
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Stop accepting jobs and release idle workers.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
            log::info!("Delivery queue shut down");
        }
    }

    /// Fail every job that is still unresolved. Returns how many there were.
    pub fn abandon_pending(&self) -> usize {
        let drained: Vec<(JobToken, watch::Sender<JobState>)> =
            lock_pending(&self.pending).drain().collect();
        let count = drained.len();
        for (token, state_tx) in drained {
            log::warn!("Abandoning {token}");
            state_tx.send_replace(JobState::Failed(RelayError::Queue("job abandoned".into())));
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn submit_timeout(&self) -> Duration {
        self.submit_timeout
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            pending: lock_pending(&self.pending).len(),
        }
    }
}

fn lock_pending(
    pending: &PendingJobs,
) -> std::sync::MutexGuard<'_, HashMap<JobToken, watch::Sender<JobState>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve_pending(
    pending: &PendingJobs,
    stats: &AtomicQueueStats,
    token: JobToken,
    result: Result<Message, RelayError>,
) {
    let state = match result {
        Ok(message) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            JobState::Completed(message)
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            JobState::Failed(err)
        }
    };
    match lock_pending(pending).get(&token) {
        Some(state_tx) => {
            state_tx.send_replace(state);
        }
        None => log::debug!("{token} resolved after its waiter left"),
    }
}
