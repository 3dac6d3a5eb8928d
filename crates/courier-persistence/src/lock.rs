//! Acquire-if-absent lock keys with a time-to-live.
//!
//! A lock key is held by an owner token chosen by the caller. Only the owner
//! can renew or release it. Expiry is the only recovery path for a holder
//! that crashed before releasing; a live holder whose critical section may
//! outlast the TTL must renew before it writes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::atomic::{atomic_write, create_exclusive, ensure_dir, read_optional, remove_if_exists};
use crate::error::{PersistenceError, Result};

/// A provider of short-lived exclusive keys.
pub trait LockProvider: Send + Sync {
    /// Atomically takes `key` for `owner` with the given time-to-live if it
    /// is absent or expired. Returns false if someone else holds it.
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Pushes the expiry of `key` out to `ttl` from now.
    ///
    /// Returns false if `owner` no longer holds the key, in which case
    /// nothing is changed.
    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` if `owner` still holds it.
    fn release(&self, key: &str, owner: &str) -> Result<()>;
}

struct LocalEntry {
    owner: String,
    expires_at: Instant,
}

/// In-process lock table.
#[derive(Default)]
pub struct LocalLock {
    held: Mutex<HashMap<String, LocalEntry>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LocalEntry>>> {
        self.held
            .lock()
            .map_err(|e| PersistenceError::Poisoned(e.to_string()))
    }
}

impl LockProvider for LocalLock {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.table()?;

        let now = Instant::now();
        match held.get(key) {
            Some(entry) if entry.expires_at > now => Ok(false),
            _ => {
                held.insert(
                    key.to_string(),
                    LocalEntry {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        match self.table()?.get_mut(key) {
            Some(entry) if entry.owner == owner => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut held = self.table()?;
        if held.get(key).is_some_and(|entry| entry.owner == owner) {
            held.remove(key);
        }
        Ok(())
    }
}

/// Lock files in a shared directory, one per key.
///
/// The file is created with `create_new`, so only one process can win, and
/// holds `<expiry ms since the Unix epoch> <owner>`. A file whose expiry has
/// passed is moved aside so the next attempt can create it anew.
///
/// Breaking a stale file is not atomic. If the lock is re-taken between a
/// breaker's read and its rename, the fresh file is linked back, but a third
/// process may create the path before the link lands; two processes then
/// both believe they hold the key until the displaced one next calls
/// [`renew`](LockProvider::renew), which sees a foreign owner and fails.
/// Callers that renew immediately before each write keep that window to the
/// gap between the renew and the write.
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    /// Creates a lock provider keeping its files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.lock", name))
    }

    fn contents(owner: &str, ttl: Duration) -> String {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        format!("{} {}", expires_at, owner)
    }

    fn owner_of(contents: &str) -> Option<&str> {
        contents.split_whitespace().nth(1)
    }

    /// Expiry recorded in a lock file, falling back to its modification time
    /// plus `ttl` when the holder has not finished writing it.
    fn expiry_ms(path: &Path, contents: &str, ttl: Duration) -> Option<i64> {
        let recorded = contents
            .split_whitespace()
            .next()
            .and_then(|ms| ms.parse::<i64>().ok());
        if recorded.is_some() {
            return recorded;
        }
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let modified: chrono::DateTime<Utc> = modified.into();
        Some(modified.timestamp_millis() + ttl.as_millis() as i64)
    }

    /// Moves an expired lock file out of the way.
    ///
    /// If another process replaced the file between our read and the move,
    /// the fresh file is linked back into place.
    fn break_stale(&self, path: &Path, stale_contents: &str) -> Result<()> {
        let tomb = path.with_extension(format!(
            "stale-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        match fs::rename(path, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(PersistenceError::WriteError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let moved = read_optional(&tomb)?.unwrap_or_default();
        if moved != stale_contents {
            if fs::hard_link(&tomb, path).is_err() {
                warn!(path = %path.display(), "lock re-taken while breaking stale file");
            }
        } else {
            warn!(path = %path.display(), "broke expired lock");
        }

        remove_if_exists(&tomb)?;
        Ok(())
    }
}

impl LockProvider for FileLock {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        ensure_dir(&self.dir)?;
        let path = self.lock_path(key);

        if create_exclusive(&path, Self::contents(owner, ttl).as_bytes())? {
            return Ok(true);
        }

        let Some(contents) = read_optional(&path)? else {
            // Released between our attempt and the read; retry on next poll.
            return Ok(false);
        };

        match Self::expiry_ms(&path, &contents, ttl) {
            Some(expiry) if expiry <= Utc::now().timestamp_millis() => {
                self.break_stale(&path, &contents)?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let path = self.lock_path(key);
        let current = read_optional(&path)?;
        if current.as_deref().and_then(Self::owner_of) != Some(owner) {
            debug!(path = %path.display(), "lock no longer held by this owner");
            return Ok(false);
        }

        atomic_write(&path, Self::contents(owner, ttl).as_bytes())?;
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let path = self.lock_path(key);
        let current = read_optional(&path)?;
        if current.as_deref().and_then(Self::owner_of) == Some(owner) {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(1);

    fn exercise_basic(provider: &dyn LockProvider) {
        assert!(provider.try_acquire("queue/mutex", "a", TTL).unwrap());
        assert!(!provider.try_acquire("queue/mutex", "b", TTL).unwrap());
        // Unrelated keys are independent.
        assert!(provider.try_acquire("other", "b", TTL).unwrap());

        provider.release("queue/mutex", "a").unwrap();
        assert!(provider.try_acquire("queue/mutex", "b", TTL).unwrap());
    }

    fn exercise_ownership(provider: &dyn LockProvider) {
        assert!(provider.try_acquire("k", "a", TTL).unwrap());

        assert!(provider.renew("k", "a", TTL).unwrap());
        assert!(!provider.renew("k", "b", TTL).unwrap());

        // A foreign release leaves the key held.
        provider.release("k", "b").unwrap();
        assert!(!provider.try_acquire("k", "b", TTL).unwrap());

        provider.release("k", "a").unwrap();
        assert!(!provider.renew("k", "a", TTL).unwrap());
    }

    fn exercise_lost_lease(provider: &dyn LockProvider) {
        assert!(provider.try_acquire("k", "old", Duration::from_millis(20)).unwrap());
        thread::sleep(Duration::from_millis(40));

        // The file provider needs one attempt to clear the stale file.
        let mut taken = false;
        for _ in 0..3 {
            if provider.try_acquire("k", "new", TTL).unwrap() {
                taken = true;
                break;
            }
        }
        assert!(taken);

        assert!(!provider.renew("k", "old", TTL).unwrap());
        provider.release("k", "old").unwrap();
        assert!(!provider.try_acquire("k", "third", TTL).unwrap());
    }

    #[test]
    fn test_local_lock_basic() {
        exercise_basic(&LocalLock::new());
    }

    #[test]
    fn test_file_lock_basic() {
        let dir = tempdir().unwrap();
        exercise_basic(&FileLock::new(dir.path()));
    }

    #[test]
    fn test_local_lock_ownership() {
        exercise_ownership(&LocalLock::new());
    }

    #[test]
    fn test_file_lock_ownership() {
        let dir = tempdir().unwrap();
        exercise_ownership(&FileLock::new(dir.path()));
    }

    #[test]
    fn test_local_lock_lost_lease() {
        exercise_lost_lease(&LocalLock::new());
    }

    #[test]
    fn test_file_lock_lost_lease() {
        let dir = tempdir().unwrap();
        exercise_lost_lease(&FileLock::new(dir.path()));
    }

    #[test]
    fn test_renew_extends_expiry() {
        let lock = LocalLock::new();
        assert!(lock.try_acquire("k", "a", Duration::from_millis(30)).unwrap());
        thread::sleep(Duration::from_millis(15));
        assert!(lock.renew("k", "a", Duration::from_millis(200)).unwrap());
        thread::sleep(Duration::from_millis(30));

        assert!(!lock.try_acquire("k", "b", TTL).unwrap());
    }

    #[test]
    fn test_local_lock_expires() {
        let lock = LocalLock::new();
        assert!(lock.try_acquire("k", "a", Duration::from_millis(20)).unwrap());
        thread::sleep(Duration::from_millis(40));
        assert!(lock.try_acquire("k", "b", TTL).unwrap());
    }

    #[test]
    fn test_file_lock_breaks_expired_file() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(dir.path());

        assert!(lock.try_acquire("k", "a", Duration::from_millis(20)).unwrap());
        thread::sleep(Duration::from_millis(40));

        // First attempt clears the stale file, the next one wins.
        assert!(!lock.try_acquire("k", "b", TTL).unwrap());
        assert!(lock.try_acquire("k", "b", TTL).unwrap());
        assert!(!lock.try_acquire("k", "c", TTL).unwrap());
    }

    #[test]
    fn test_file_lock_key_sanitized() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(dir.path());

        assert!(lock.try_acquire("courier/queue/mutex", "a", TTL).unwrap());
        let contents = fs::read_to_string(dir.path().join("courier_queue_mutex.lock")).unwrap();
        assert!(contents.ends_with(" a"));
    }

    #[test]
    fn test_release_missing_key_is_ok() {
        let dir = tempdir().unwrap();
        FileLock::new(dir.path()).release("never-held", "a").unwrap();
        LocalLock::new().release("never-held", "a").unwrap();
    }

    #[test]
    fn test_file_lock_single_winner_across_threads() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                thread::spawn(move || {
                    FileLock::new(path)
                        .try_acquire("k", &format!("owner-{}", i), TTL)
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
