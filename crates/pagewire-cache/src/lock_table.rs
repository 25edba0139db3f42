use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{CacheResult, Release};

/// Named in-process locks. An entry lives only while someone holds or waits
/// for it, so the table does not grow with the number of keys ever locked.
#[derive(Default)]
pub(crate) struct LockTable {
    entries: DashMap<String, LockEntry>,
}

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    holders: usize,
}

impl LockTable {
    pub(crate) async fn acquire(self: &Arc<Self>, key: &str) -> HeldLock {
        let mutex = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| LockEntry {
                    mutex: Arc::new(Mutex::new(())),
                    holders: 0,
                });
            entry.holders += 1;
            Arc::clone(&entry.mutex)
        };
        // Registered before awaiting so a cancelled waiter still gives back its count.
        let registration = Registration {
            table: Arc::clone(self),
            key: key.to_string(),
        };
        let guard = mutex.lock_owned().await;
        HeldLock {
            guard: Some(guard),
            _registration: registration,
        }
    }

    fn release(&self, key: &str) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) {
            let entry = occupied.get_mut();
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                occupied.remove();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Registration {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// Field order matters: the mutex guard drops before the registration.
pub(crate) struct HeldLock {
    guard: Option<OwnedMutexGuard<()>>,
    _registration: Registration,
}

#[async_trait]
impl Release for HeldLock {
    async fn release(&mut self) -> CacheResult<()> {
        self.guard.take();
        Ok(())
    }
}
