//! Relay configuration.
//!
//! `RelayConfig::default()` is the production shape; `for_testing()` shrinks
//! timeouts and backoff so tests run fast. The server binary starts from
//! `RelayConfig::from_env()`, which overlays `COURIER_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::CallStatus;
use crate::storage::StoreConfig;

/// How strictly call status changes are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionPolicy {
    /// Only forward moves through ringing → active → ended.
    #[default]
    Strict,
    /// Any status may be set.
    Permissive,
}

impl TransitionPolicy {
    pub fn allows(self, from: CallStatus, to: CallStatus) -> bool {
        match self {
            TransitionPolicy::Strict => from.can_transition_to(to),
            TransitionPolicy::Permissive => true,
        }
    }
}

impl FromStr for TransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(TransitionPolicy::Strict),
            "permissive" => Ok(TransitionPolicy::Permissive),
            other => Err(format!("unknown transition policy '{other}'")),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Durable ledger settings (None = in-memory ledger)
    pub storage: Option<StoreConfig>,
    /// Number of delivery workers (default: 4)
    pub worker_count: usize,
    /// Bounded delivery queue capacity (default: 1024)
    pub queue_capacity: usize,
    /// Total delivery attempts per job, first try included (default: 3)
    pub max_attempts: u32,
    /// Backoff before the first redelivery, doubled each attempt (default: 100ms)
    pub retry_backoff_ms: u64,
    /// How long a submitter waits for its job to resolve (default: 30s)
    pub submit_timeout_secs: u64,
    /// Events buffered per observer before it starts dropping (default: 256)
    pub broadcast_capacity: usize,
    /// Minimum interval between relayed "started typing" notices (default: 500ms)
    pub typing_throttle_ms: u64,
    pub transition_policy: TransitionPolicy,
    /// Reject calls on unknown conversations (default: true)
    pub require_call_conversation: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            storage: None,
            worker_count: 4,
            queue_capacity: 1024,
            max_attempts: 3,
            retry_backoff_ms: 100,
            submit_timeout_secs: 30,
            broadcast_capacity: 256,
            typing_throttle_ms: 500,
            transition_policy: TransitionPolicy::Strict,
            require_call_conversation: true,
        }
    }
}

impl RelayConfig {
    /// Create config for testing (in-memory, short waits).
    pub fn for_testing() -> Self {
        Self {
            storage: None,
            worker_count: 2,
            queue_capacity: 64,
            max_attempts: 3,
            retry_backoff_ms: 5,
            submit_timeout_secs: 5,
            broadcast_capacity: 64,
            typing_throttle_ms: 500,
            transition_policy: TransitionPolicy::Strict,
            require_call_conversation: true,
        }
    }

    /// Use a RocksDB ledger at `path` with default tuning.
    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Some(StoreConfig {
            path: path.into(),
            ..StoreConfig::default()
        });
        self
    }

    /// Defaults overlaid with `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("COURIER_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config = config.with_storage(dir);
        }
        overlay(&lookup, "COURIER_WORKERS", &mut config.worker_count);
        overlay(&lookup, "COURIER_QUEUE_CAPACITY", &mut config.queue_capacity);
        overlay(&lookup, "COURIER_MAX_ATTEMPTS", &mut config.max_attempts);
        overlay(&lookup, "COURIER_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms);
        overlay(&lookup, "COURIER_SUBMIT_TIMEOUT_SECS", &mut config.submit_timeout_secs);
        overlay(&lookup, "COURIER_BROADCAST_CAPACITY", &mut config.broadcast_capacity);
        overlay(&lookup, "COURIER_TYPING_THROTTLE_MS", &mut config.typing_throttle_ms);
        overlay(&lookup, "COURIER_TRANSITION_POLICY", &mut config.transition_policy);
        overlay(
            &lookup,
            "COURIER_REQUIRE_CALL_CONVERSATION",
            &mut config.require_call_conversation,
        );

        config.worker_count = config.worker_count.max(1);
        config.max_attempts = config.max_attempts.max(1);
        config
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn typing_throttle(&self) -> Duration {
        Duration::from_millis(self.typing_throttle_ms)
    }

    /// Backoff before redelivering a job that just failed `attempt`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << shift))
    }
}

fn overlay<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => log::warn!("Ignoring {key}={raw:?}: {e}"),
    }
}
