//! In-memory mutual-exclusion registry keyed by an arbitrary key (repository
//! id or application id).
//!
//! The agent is a single long-running process, not a one-shot CLI invocation,
//! so there is no need for a filesystem lock file to protect against a second
//! process; what matters is serialising concurrent tasks *within* this
//! process. This keeps the acquire/stale-timeout/drop-release shape of the
//! teacher's file-based lock but backs it with an in-memory map of per-key
//! mutexes instead of a JSON file on disk. `tokio::sync::Mutex` is used
//! purely for its owned-guard support (`blocking_lock_owned`/`try_lock_owned`)
//! so a guard can outlive the map lookup that produced it without unsafe
//! code — not as an async primitive.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tokio::sync::{OwnedMutexGuard, Mutex as AsyncMutex};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    acquired_at: Option<Instant>,
}

/// Holds one mutex per key, created lazily on first acquire. Cheap to clone;
/// all clones share the same underlying map.
#[derive(Clone)]
pub struct LockRegistry<K> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
}

impl<K> Default for LockRegistry<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockRegistry<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot_mutex(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().expect("lock registry poisoned");
        slots
            .entry(key.clone())
            .or_insert_with(|| Slot { mutex: Arc::new(AsyncMutex::new(())), acquired_at: None })
            .mutex
            .clone()
    }

    fn record_acquired(&self, key: &K) {
        let mut slots = self.slots.lock().expect("lock registry poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.acquired_at = Some(Instant::now());
        }
    }

    /// Block until the lock for `key` is free, then hold it until the
    /// returned guard is dropped.
    pub fn acquire(&self, key: &K) -> KeyGuard {
        let mutex = self.slot_mutex(key);
        let guard = mutex.blocking_lock_owned();
        self.record_acquired(key);
        KeyGuard { _guard: guard }
    }

    /// Fail immediately rather than blocking if another caller currently
    /// holds the lock for this key.
    pub fn try_acquire(&self, key: &K) -> Result<KeyGuard> {
        let mutex = self.slot_mutex(key);
        let guard = Arc::clone(&mutex)
            .try_lock_owned()
            .map_err(|_| anyhow::anyhow!("lock already held for this key"))?;
        self.record_acquired(key);
        Ok(KeyGuard { _guard: guard })
    }

    /// How long ago the lock for `key` was last acquired, if ever.
    pub fn age(&self, key: &K) -> Option<Duration> {
        let slots = self.slots.lock().expect("lock registry poisoned");
        slots.get(key).and_then(|s| s.acquired_at).map(|t| t.elapsed())
    }
}

/// RAII guard returned by [`LockRegistry::acquire`]/`try_acquire`. Releases
/// the lock for its key on drop.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Fail with a descriptive error if `key` has been held longer than
/// `timeout`; used by callers that want to treat a long-held lock as a
/// defence-in-depth signal worth surfacing rather than blocking on forever.
pub fn reject_if_stale<K: Hash + Eq + Clone>(
    registry: &LockRegistry<K>,
    key: &K,
    timeout: Duration,
) -> Result<()> {
    if let Some(age) = registry.age(key)
        && age > timeout
    {
        bail!("lock for key held for {:?}, exceeding timeout {:?}", age, timeout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn acquire_serialises_same_key() {
        let registry: LockRegistry<String> = LockRegistry::new();
        let counter = Arc::new(Mutex::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _guard = registry.acquire(&"app-1".to_string());
                let mut c = counter.lock().expect("counter");
                *c += 1;
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(*counter.lock().expect("counter"), 8);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let registry: LockRegistry<String> = LockRegistry::new();
        let _held = registry.acquire(&"app-1".to_string());
        let attempt = registry.try_acquire(&"app-1".to_string());
        assert!(attempt.is_err());
    }

    #[test]
    fn try_acquire_succeeds_after_release() {
        let registry: LockRegistry<String> = LockRegistry::new();
        {
            let _held = registry.acquire(&"app-1".to_string());
        }
        let attempt = registry.try_acquire(&"app-1".to_string());
        assert!(attempt.is_ok());
    }

    #[test]
    fn different_keys_do_not_contend() {
        let registry: LockRegistry<String> = LockRegistry::new();
        let _a = registry.acquire(&"app-1".to_string());
        let b = registry.try_acquire(&"app-2".to_string());
        assert!(b.is_ok());
    }

    #[test]
    fn age_reports_none_before_first_acquire() {
        let registry: LockRegistry<String> = LockRegistry::new();
        assert!(registry.age(&"app-1".to_string()).is_none());
    }

    #[test]
    fn reject_if_stale_errors_past_timeout() {
        let registry: LockRegistry<String> = LockRegistry::new();
        let _guard = registry.acquire(&"app-1".to_string());
        thread::sleep(Duration::from_millis(20));
        let result = reject_if_stale(&registry, &"app-1".to_string(), Duration::from_millis(5));
        assert!(result.is_err());
    }

    #[test]
    fn reject_if_stale_ok_within_timeout() {
        let registry: LockRegistry<String> = LockRegistry::new();
        let _guard = registry.acquire(&"app-1".to_string());
        let result = reject_if_stale(&registry, &"app-1".to_string(), Duration::from_secs(10));
        assert!(result.is_ok());
    }
}
