//! Per-client mutual exclusion, and reservations of values that must be
//! unique across clients.

use nsboot_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of async mutexes keyed by client id. Entries are dropped once no
/// guard or waiter refers to them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Lock several keys in sorted order so two callers never deadlock.
    pub async fn lock_all(&self, keys: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<&str> = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unique values (id, MAC, IP, host name) claimed by requests that have not
/// yet committed. A value is held from the uniqueness check until the
/// [`Reservation`] is dropped.
#[derive(Default)]
pub struct Reservations {
    held: StdMutex<HashSet<String>>,
}

/// Values held by one request; released on drop.
#[must_use]
pub struct Reservation<'a> {
    owner: &'a Reservations,
    keys: Vec<String>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key or none of them.
    pub fn claim<I>(&self, keys: I) -> Result<Reservation<'_>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(taken) = keys.iter().find(|key| held.contains(*key)) {
            return Err(Error::conflict(format!(
                "{} is being claimed by another request",
                taken
            )));
        }
        held.extend(keys.iter().cloned());
        Ok(Reservation { owner: self, keys })
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut held = self.owner.held.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("lab01").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("lab01").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("lab01").await;
        tokio::time::timeout(Duration::from_secs(1), locks.lock("lab02"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_entries_are_pruned() {
        let locks = KeyedLocks::new();
        {
            let _guards = locks.lock_all(&["b", "a", "b"]).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_reservation_conflicts_until_dropped() {
        let reservations = Reservations::new();
        let first = reservations
            .claim(["MAC address AA:BB:CC:DD:EE:01".to_string(), "IP address 10.0.0.1".to_string()])
            .unwrap();

        let err = reservations
            .claim(["IP address 10.0.0.2".to_string(), "MAC address AA:BB:CC:DD:EE:01".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:01"));
        assert_eq!(reservations.len(), 2);

        drop(first);
        assert!(reservations.is_empty());
        let _second = reservations
            .claim(["MAC address AA:BB:CC:DD:EE:01".to_string()])
            .unwrap();
    }
}
