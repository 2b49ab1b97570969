//! Keyed async locks.
//!
//! One global `Write` key serializes every consensus update. Per-address keys
//! serialize validation of units that share an author, since the serial
//! check needs a stable view of what that address has already authored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::consensus::Address;

/// What a lock protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// The single consensus write section
    Write,
    Address(Address),
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

/// Registry handing out one async mutex per key.
#[derive(Debug, Default)]
pub struct LockRegistry {
    handles: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: LockKey) -> Arc<AsyncMutex<()>> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.entry(key).or_default().clone()
    }

    pub async fn lock(&self, key: LockKey) -> LockGuard {
        let guard = self.handle(key).lock_owned().await;
        LockGuard {
            keys: vec![key],
            _guards: vec![guard],
        }
    }

    /// Acquire several keys at once.
    ///
    /// Keys are sorted and deduplicated first so that two callers asking for
    /// overlapping sets always acquire in the same order.
    pub async fn lock_many(&self, keys: impl IntoIterator<Item = LockKey>) -> LockGuard {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for &key in &keys {
            guards.push(self.handle(key).lock_owned().await);
        }
        LockGuard {
            keys,
            _guards: guards,
        }
    }

    /// Acquire `key` only if nobody holds it.
    pub fn try_lock(&self, key: LockKey) -> Option<LockGuard> {
        let guard = self.handle(key).try_lock_owned().ok()?;
        Some(LockGuard {
            keys: vec![key],
            _guards: vec![guard],
        })
    }

    /// Drop handles nobody is holding or waiting on.
    pub fn prune_idle(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let before = handles.len();
        handles.retain(|_, h| Arc::strong_count(h) > 1);
        before - handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> LockKey {
        LockKey::Address(Address([n; 32]))
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let registry = LockRegistry::new();
        let guard = registry.lock(LockKey::Write).await;
        assert!(registry.try_lock(LockKey::Write).is_none());
        assert!(registry.try_lock(addr(1)).is_some());
        drop(guard);
        assert!(registry.try_lock(LockKey::Write).is_some());
    }

    #[tokio::test]
    async fn lock_many_sorts_and_dedups() {
        let registry = LockRegistry::new();
        let guard = registry.lock_many([addr(3), addr(1), addr(3)]).await;
        assert_eq!(guard.keys(), &[addr(1), addr(3)]);
        assert!(registry.try_lock(addr(1)).is_none());
        assert!(registry.try_lock(addr(3)).is_none());
        assert!(registry.try_lock(addr(2)).is_some());
    }

    #[tokio::test]
    async fn guard_released_on_error_path() {
        let registry = LockRegistry::new();
        async fn failing(registry: &LockRegistry) -> Result<(), &'static str> {
            let _guard = registry.lock(addr(9)).await;
            Err("validation failed")
        }
        assert!(failing(&registry).await.is_err());
        assert!(registry.try_lock(addr(9)).is_some());
    }

    #[tokio::test]
    async fn waiting_task_acquires_after_release() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.lock(LockKey::Write).await;
        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.lock(LockKey::Write).await;
            true
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn prune_idle_keeps_held_handles() {
        let registry = LockRegistry::new();
        let held = registry.lock(addr(1)).await;
        drop(registry.lock(addr(2)).await);
        assert_eq!(registry.prune_idle(), 1);
        drop(held);
        assert_eq!(registry.prune_idle(), 1);
    }
}
