//! Multi-key exclusive lock
//!
//! Grants exclusive ownership of a whole set of keys at once. A caller waits
//! until none of its keys is held by anyone else, then takes all of them.

use std::collections::HashSet;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Exclusive lock over arbitrary key sets.
#[derive(Debug)]
pub struct KeysLock<K> {
    locked: Mutex<HashSet<K>>,
    released: Notify,
}

impl<K> Default for KeysLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
            released: Notify::new(),
        }
    }
}

impl<K> KeysLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every key is free and take them all.
    pub async fn lock(&self, keys: impl IntoIterator<Item = K>) -> KeysLockGuard<'_, K> {
        let keys: Vec<K> = keys
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        loop {
            // register interest before checking so a release in between is not lost
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut locked = self.locked.lock();
                if keys.iter().all(|k| !locked.contains(k)) {
                    locked.extend(keys.iter().cloned());
                    return KeysLockGuard { owner: self, keys };
                }
            }

            notified.await;
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.locked.lock().contains(key)
    }

    fn release(&self, keys: &[K]) {
        {
            let mut locked = self.locked.lock();
            for key in keys {
                locked.remove(key);
            }
        }
        self.released.notify_waiters();
    }
}

/// Releases its keys on drop.
#[must_use = "keys are released as soon as the guard is dropped"]
pub struct KeysLockGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeysLock<K>,
    keys: Vec<K>,
}

impl<K> KeysLockGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K> Drop for KeysLockGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.owner.release(&self.keys);
    }
}
