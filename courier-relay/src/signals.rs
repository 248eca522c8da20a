//! Append-only signaling buckets.
//!
//! Each call owns three independent buckets (offer, answer, ice). A signal's
//! sequence is its zero-based position in its bucket, so a consumer can keep
//! one cursor per kind and ask only for what it has not applied yet.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{SequencedSignal, Signal, SignalKind};

/// Per-call, per-kind signal storage. Payloads are never inspected.
#[derive(Default)]
pub struct SignalStore {
    buckets: RwLock<HashMap<(Uuid, SignalKind), Vec<Signal>>>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the bucket and return the signal's sequence.
    pub async fn append(&self, call_id: Uuid, kind: SignalKind, signal: Signal) -> u64 {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry((call_id, kind)).or_default();
        bucket.push(signal);
        (bucket.len() - 1) as u64
    }

    /// All signals of a kind in append order. Empty for an unknown bucket.
    pub async fn list(&self, call_id: Uuid, kind: SignalKind) -> Vec<Signal> {
        self.buckets
            .read()
            .await
            .get(&(call_id, kind))
            .cloned()
            .unwrap_or_default()
    }

    /// Signals at positions `>= since`, with their sequences.
    pub async fn list_since(&self, call_id: Uuid, kind: SignalKind, since: u64) -> Vec<SequencedSignal> {
        let buckets = self.buckets.read().await;
        let Some(bucket) = buckets.get(&(call_id, kind)) else {
            return Vec::new();
        };
        bucket
            .iter()
            .enumerate()
            .skip(since.min(bucket.len() as u64) as usize)
            .map(|(i, signal)| SequencedSignal {
                sequence: i as u64,
                signal: signal.clone(),
            })
            .collect()
    }

    pub async fn bucket_len(&self, call_id: Uuid, kind: SignalKind) -> usize {
        self.buckets
            .read()
            .await
            .get(&(call_id, kind))
            .map_or(0, Vec::len)
    }
}

/// Client-side record of which signals have been applied, per kind.
#[derive(Debug, Clone, Default)]
pub struct SignalCursor {
    next: HashMap<SignalKind, u64>,
}

impl SignalCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence not yet applied for `kind`.
    pub fn position(&self, kind: SignalKind) -> u64 {
        self.next.get(&kind).copied().unwrap_or(0)
    }

    /// Apply signals in sequence order starting at `position(kind)`.
    /// Already applied sequences are skipped. Application stops at the first
    /// gap, so a `since` listing that starts past the cursor yields nothing
    /// until the missing signals are supplied.
    pub fn accept(&mut self, kind: SignalKind, signals: Vec<SequencedSignal>) -> Vec<Signal> {
        let next = self.next.entry(kind).or_insert(0);
        let mut fresh = Vec::new();
        for sequenced in signals {
            if sequenced.sequence < *next {
                continue;
            }
            if sequenced.sequence > *next {
                break;
            }
            *next += 1;
            fresh.push(sequenced.signal);
        }
        fresh
    }
}
