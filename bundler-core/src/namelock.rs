//! Per-cache-id serialization so concurrent refinements of the same module
//! never race on its disk file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Maps a cache id to a dedicated async mutex. Acquiring the mutex for an
/// id serializes all disk access for that id; the map itself is guarded by
/// a short-held `std::sync::Mutex` since it's only touched to look up or
/// insert an `Arc`, never held across an `.await`.
#[derive(Default)]
pub struct NameLock {
    locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl NameLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("name lock map poisoned");
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquires exclusive access for `id`, returning a guard that releases
    /// it on drop.
    pub async fn acquire(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = self.entry(id);
        lock.lock_owned().await
    }

    /// Waits for every currently-registered id's lock to become free at
    /// least once, without holding any of them afterwards. Used by shutdown
    /// to ensure no in-flight save is still writing when the cache map is
    /// persisted.
    pub async fn wait_all(&self) {
        let locks: Vec<Arc<Mutex<()>>> = {
            let guard = self.locks.lock().expect("name lock map poisoned");
            guard.values().cloned().collect()
        };
        for lock in locks {
            let _ = lock.lock().await;
        }
    }

    /// Drops the dedicated lock for `id`, reclaiming memory once a module
    /// is freed from the registry. Safe to call even if a guard is still
    /// held elsewhere; the `Arc` keeps the mutex alive until released.
    pub fn forget(&self, id: i64) {
        let mut locks = self.locks.lock().expect("name lock map poisoned");
        locks.remove(&id);
    }
}
