use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key mutual exclusion. The returned guard releases on drop,
/// so release is idempotent and cannot double-fire.
/// Different keys proceed in parallel, same-key callers serialize.
#[derive(Default)]
pub struct KeyedLock<K>(Mutex<HashMap<K, Arc<Mutex<()>>>>);

impl<K: Eq + Hash + Clone> KeyedLock<K> {
  /// Waits until the key is free.
  pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
    self.entry(key).await.lock_owned().await
  }

  /// Returns None when the key is currently held.
  pub async fn try_acquire(
    &self,
    key: K,
  ) -> Option<OwnedMutexGuard<()>> {
    self.entry(key).await.try_lock_owned().ok()
  }

  async fn entry(&self, key: K) -> Arc<Mutex<()>> {
    let mut lock = self.0.lock().await;
    lock.entry(key).or_default().clone()
  }
}

/// Prevents simultaneous / rapid fire access to an action,
/// returning the cached result instead in these situations.
#[derive(Default)]
pub struct TimeoutCache<K, Res>(
  Mutex<HashMap<K, Arc<Mutex<CacheEntry<Res>>>>>,
);

impl<K: Eq + Hash, Res: Default> TimeoutCache<K, Res> {
  pub async fn get_lock(
    &self,
    key: K,
  ) -> Arc<Mutex<CacheEntry<Res>>> {
    let mut lock = self.0.lock().await;
    lock.entry(key).or_default().clone()
  }
}

pub struct CacheEntry<Res> {
  /// The last cached ts
  pub last_ts: i64,
  /// The last cached result
  pub res: anyhow::Result<Res>,
}

impl<Res: Default> Default for CacheEntry<Res> {
  fn default() -> Self {
    CacheEntry {
      last_ts: 0,
      res: Ok(Res::default()),
    }
  }
}

impl<Res: Clone> CacheEntry<Res> {
  pub fn set(&mut self, res: &anyhow::Result<Res>, timestamp: i64) {
    self.res = res.as_ref().map_err(clone_anyhow_error).cloned();
    self.last_ts = timestamp;
  }

  pub fn clone_res(&self) -> anyhow::Result<Res> {
    self.res.as_ref().map_err(clone_anyhow_error).cloned()
  }
}

fn clone_anyhow_error(e: &anyhow::Error) -> anyhow::Error {
  let mut reasons =
    e.chain().map(|e| e.to_string()).collect::<Vec<_>>();
  // Always guaranteed to be at least one reason
  // Need to start the chain with the last reason
  let mut e = anyhow::Error::msg(reasons.pop().unwrap());
  // Need to reverse reason application from lowest context to highest context.
  for reason in reasons.into_iter().rev() {
    e = e.context(reason)
  }
  e
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn keyed_lock_serializes_same_key() {
    let locks: KeyedLock<String> = Default::default();
    let first = locks.acquire(String::from("repo")).await;
    assert!(locks.try_acquire(String::from("repo")).await.is_none());
    drop(first);
    assert!(locks.try_acquire(String::from("repo")).await.is_some());
  }

  #[tokio::test]
  async fn keyed_lock_independent_keys() {
    let locks: KeyedLock<String> = Default::default();
    let _a = locks.acquire(String::from("a")).await;
    assert!(locks.try_acquire(String::from("b")).await.is_some());
  }
}
