//! Queue configuration.

use std::time::Duration;

/// Lock key shared by every queue instance on the same store.
pub const DEFAULT_LOCK_KEY: &str = "courier/queue/mutex";

/// Shortest lock time-to-live accepted. A zero TTL would expire on creation.
pub const MIN_LOCK_TTL: Duration = Duration::from_millis(1);

/// Configuration for a [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name of the lock serializing queue mutations.
    pub lock_key: String,
    /// How long a lock survives a holder that never releases it.
    pub lock_ttl: Duration,
    /// Pause between lock acquisition attempts.
    pub lock_backoff: Duration,
    /// Maximum number of candidates examined per reservation.
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_ttl: Duration::from_secs(1),
            lock_backoff: Duration::from_millis(10),
            batch_size: 1000,
        }
    }
}

impl QueueConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock key.
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Sets the lock time-to-live (at least [`MIN_LOCK_TTL`]).
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl.max(MIN_LOCK_TTL);
        self
    }

    /// Sets the backoff between lock attempts.
    pub fn with_lock_backoff(mut self, backoff: Duration) -> Self {
        self.lock_backoff = backoff;
        self
    }

    /// Sets the reservation batch size (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}
