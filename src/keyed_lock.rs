use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes writers per (bucket, key).
///
/// Entries are reference-counted and removed from the map once the last
/// interested task drops its guard, so idle keys cost nothing.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    entries: Arc<DashMap<String, (usize, Arc<Mutex<()>>)>>,
}

pub struct KeyedGuard {
    entries: Arc<DashMap<String, (usize, Arc<Mutex<()>>)>>,
    compound: String,
    _guard: OwnedMutexGuard<()>,
}

fn compound_key(bucket: &str, key: &str) -> String {
    format!("{bucket}\x00{key}")
}

impl KeyedLocks {
    pub fn new() -> Self {
        KeyedLocks::default()
    }

    pub async fn lock(&self, bucket: &str, key: &str) -> KeyedGuard {
        let compound = compound_key(bucket, key);
        let mutex = {
            let mut entry = self
                .entries
                .entry(compound.clone())
                .or_insert_with(|| (0, Arc::new(Mutex::new(()))));
            entry.0 += 1;
            entry.1.clone()
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            entries: self.entries.clone(),
            compound,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.compound) {
            entry.0 -= 1;
        }
        self.entries
            .remove_if(&self.compound, |_, (refs, _)| *refs == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_is_mutually_exclusive() {
        let locks = KeyedLocks::new();
        let concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("bucket", "key").await;
                let inside = concurrent.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0);
                tokio::task::yield_now().await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("bucket", "a").await;
        // Completes immediately instead of deadlocking.
        let _b = locks.lock("bucket", "b").await;
    }

    #[tokio::test]
    async fn idle_entries_are_removed() {
        let locks = KeyedLocks::new();
        {
            let _one = locks.lock("bucket", "key").await;
            assert_eq!(locks.live_entries(), 1);
        }
        assert_eq!(locks.live_entries(), 0);
    }
}
