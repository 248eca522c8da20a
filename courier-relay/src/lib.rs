//! # courier-relay — message delivery and call signaling relay
//!
//! Accepts chat messages, persists them through a worker-driven delivery
//! queue, fans lifecycle events out to connected observers, and relays
//! WebRTC signaling between call participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     Binary Proto    │ (gateway)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │    Relay    │
//!                                     └──────┬──────┘
//!          ┌──────────────┬──────────────────┼──────────────┬─────────────┐
//!          ▼              ▼                  ▼              ▼             ▼
//!   DeliveryQueue ─► Worker ─► MessageLedger  CallRegistry  SignalStore  Broadcaster
//!                               (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Conversations, messages, calls and signals
//! - [`storage`] — `MessageLedger` trait with in-memory and RocksDB backends
//! - [`queue`] / [`worker`] — At-least-once delivery with idempotent commits
//! - [`calls`] / [`signals`] — Call lifecycle and signaling buckets
//! - [`broadcast`] / [`presence`] — Event fan-out, presence and typing
//! - [`relay`] — The facade tying it all together
//! - [`protocol`] / [`server`] / [`client`] — bincode frames over WebSocket

pub mod broadcast;
pub mod calls;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod server;
pub mod signals;
pub mod storage;
pub mod worker;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Broadcaster, ObserverInfo, Subscription};
pub use calls::CallRegistry;
pub use client::{ClientError, ConnectionState, RelayClient};
pub use config::{RelayConfig, TransitionPolicy};
pub use error::{ErrorBody, ErrorKind, RelayError};
pub use model::{
    CallKind, CallSession, CallStatus, Conversation, ConversationKind, DeliveryJob, Member,
    Message, NewCall, NewConversation, SequencedSignal, Signal, SignalKind,
};
pub use presence::{PresenceEntry, PresenceTracker, TypingNotice};
pub use protocol::{ClientFrame, Command, ProtocolError, RelayEvent, Reply, ServerFrame};
pub use queue::{DeliveryQueue, JobState, JobToken, QueueStats};
pub use relay::Relay;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use signals::{SignalCursor, SignalStore};
pub use storage::{MemoryLedger, MessageLedger, RocksLedger, StoreConfig, StoreError};
pub use worker::Worker;
