use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Guard for a held named lock. The lock is released when the guard is dropped.
pub type NamedLockGuard = OwnedMutexGuard<()>;

/// A registry of named advisory locks.
///
/// Locks are created on first use and pruned once nobody holds or waits on them.
/// Transactions keep the guards and drop them on commit or abort, which gives the
/// locks transaction scope.
#[derive(Debug, Default)]
pub struct NamedLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NamedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
    let mut locks = self.locks.lock();
    // An entry referenced only by the registry is idle.
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    locks
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(AsyncMutex::new(())))
      .clone()
  }

  /// Waits until the named lock is free and takes it.
  pub async fn acquire(&self, key: &str) -> NamedLockGuard {
    trace!(lock = key, "Acquiring named lock.");
    self.entry(key).lock_owned().await
  }

  /// Takes the named lock only if nobody else holds it.
  pub fn try_acquire(&self, key: &str) -> Option<NamedLockGuard> {
    let guard = self.entry(key).try_lock_owned().ok();
    trace!(lock = key, acquired = guard.is_some(), "Tried named lock.");
    guard
  }

  /// Number of locks currently held or awaited.
  pub fn active(&self) -> usize {
    self
      .locks
      .lock()
      .values()
      .filter(|lock| Arc::strong_count(lock) > 1)
      .count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn try_acquire_fails_while_held() {
    let locks = NamedLocks::new();
    let guard = locks.try_acquire("uid:a").expect("free lock");
    assert!(locks.try_acquire("uid:a").is_none());
    assert!(locks.try_acquire("uid:b").is_some());
    drop(guard);
    assert!(locks.try_acquire("uid:a").is_some());
  }

  #[tokio::test]
  async fn acquire_waits_for_release() {
    let locks = Arc::new(NamedLocks::new());
    let guard = locks.acquire("implicit").await;

    let waiter = {
      let locks = locks.clone();
      tokio::spawn(async move {
        let _guard = locks.acquire("implicit").await;
      })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    drop(guard);
    waiter.await.unwrap();
    assert_eq!(locks.active(), 0);
  }
}
