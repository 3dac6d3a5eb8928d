//! The queue-wide mutual exclusion lock.
//!
//! Acquisition polls a [`LockProvider`] with a fixed backoff and never gives
//! up. There is no ordering among waiters, so a waiter can be overtaken
//! repeatedly; critical sections are a handful of store operations, which
//! keeps this acceptable in practice.
//!
//! Each acquisition takes the key under a fresh owner token. The TTL only
//! bounds how long a crashed holder blocks others, so a live holder renews
//! its lease while it works ([`ExclusiveGuard::keep_alive`]) and confirms it
//! right before writing ([`ExclusiveGuard::renew`]).

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_persistence::LockProvider;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::MIN_LOCK_TTL;
use crate::error::{QueueError, Result};

/// A named lock with a time-to-live, shared by every queue on a store.
pub struct QueueMutex {
    provider: Arc<dyn LockProvider>,
    key: String,
    ttl: Duration,
    backoff: Duration,
}

impl QueueMutex {
    pub fn new(
        provider: Arc<dyn LockProvider>,
        key: impl Into<String>,
        ttl: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            provider,
            key: key.into(),
            ttl: ttl.max(MIN_LOCK_TTL),
            backoff,
        }
    }

    /// Blocks until the lock is held.
    ///
    /// Provider failures (I/O on the lock file, for instance) are returned
    /// immediately; contention is retried forever.
    pub fn acquire(&self) -> Result<ExclusiveGuard<'_>> {
        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut attempts: u64 = 1;

        while !self.provider.try_acquire(&self.key, &owner, self.ttl)? {
            trace!(key = %self.key, attempts, "lock held, backing off");
            thread::sleep(self.backoff);
            attempts += 1;
        }

        if attempts > 1 {
            debug!(
                key = %self.key,
                attempts,
                waited_ms = started.elapsed().as_millis() as u64,
                "lock acquired after contention"
            );
        }

        Ok(ExclusiveGuard {
            mutex: self,
            owner,
            renewed_at: Cell::new(Instant::now()),
            released: false,
        })
    }

    /// Runs `work` while holding the lock.
    ///
    /// The lock is released exactly once after a successful acquire, whether
    /// `work` succeeds, fails, or panics. An error from `work` takes
    /// precedence over an error from the release.
    pub fn run_exclusive<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&ExclusiveGuard<'_>) -> Result<T>,
    {
        let guard = self.acquire()?;
        let result = work(&guard);

        match guard.release() {
            Ok(()) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to release queue lock");
                result.and(Err(e))
            }
        }
    }
}

/// Proof of holding a [`QueueMutex`]; releases on drop.
pub struct ExclusiveGuard<'a> {
    mutex: &'a QueueMutex,
    owner: String,
    renewed_at: Cell<Instant>,
    released: bool,
}

impl ExclusiveGuard<'_> {
    /// Extends the lease by a full TTL.
    ///
    /// Fails with `LockLost` if the lease already expired and another holder
    /// took the key; nothing may be written after that.
    pub fn renew(&self) -> Result<()> {
        let mutex = self.mutex;
        if !mutex.provider.renew(&mutex.key, &self.owner, mutex.ttl)? {
            warn!(key = %mutex.key, "queue lock lost while held");
            return Err(QueueError::LockLost(mutex.key.clone()));
        }
        self.renewed_at.set(Instant::now());
        Ok(())
    }

    /// Renews the lease once half of it has elapsed.
    pub fn keep_alive(&self) -> Result<()> {
        if self.renewed_at.get().elapsed() >= self.mutex.ttl / 2 {
            self.renew()?;
        }
        Ok(())
    }

    /// Releases the lock, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.mutex.provider.release(&self.mutex.key, &self.owner)?;
        Ok(())
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.mutex.provider.release(&self.mutex.key, &self.owner) {
            warn!(key = %self.mutex.key, error = %e, "failed to release queue lock on unwind");
        }
    }
}
