//! Per-user sharded registry.
//!
//! One authoritative table per process. Keys hash to a fixed shard, so all
//! mutations for a given user serialize on that shard's lock while other
//! users proceed in parallel. Callers never hold a shard lock across an
//! await or a send.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tasksync_types::UserId;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// A map from user id to `V`, split over independently locked shards.
#[derive(Debug)]
pub struct ShardedRegistry<V> {
    shards: Box<[RwLock<HashMap<UserId, V>>]>,
}

impl<V> ShardedRegistry<V> {
    /// Create a registry with `shards` shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, key: &UserId) -> &RwLock<HashMap<UserId, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Read the entry for `key`.
    pub fn read<R>(&self, key: &UserId, f: impl FnOnce(Option<&V>) -> R) -> R {
        let shard = self.shard(key).read();
        f(shard.get(key))
    }

    /// Mutate the slot for `key` under its shard's write lock.
    ///
    /// The closure sees `None` when absent; leaving `None` in the slot
    /// removes the entry, leaving `Some` stores it.
    pub fn mutate<R>(&self, key: &UserId, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let mut shard = self.shard(key).write();
        let mut slot = shard.remove(key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            shard.insert(key.clone(), value);
        }
        result
    }

    /// Whether `key` has an entry.
    pub fn contains(&self, key: &UserId) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true if no shard holds an entry.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Visit every entry. Each shard is read-locked in turn.
    pub fn for_each(&self, mut f: impl FnMut(&UserId, &V)) {
        for shard in self.shards.iter() {
            for (k, v) in shard.read().iter() {
                f(k, v);
            }
        }
    }

    /// Mutate every entry; entries for which `f` returns false are removed.
    pub fn retain(&self, mut f: impl FnMut(&UserId, &mut V) -> bool) {
        for shard in self.shards.iter() {
            shard.write().retain(|k, v| f(k, v));
        }
    }
}

impl<V> Default for ShardedRegistry<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutate_insert_and_remove() {
        let reg: ShardedRegistry<u32> = ShardedRegistry::default();
        let alice = UserId::new("alice");

        reg.mutate(&alice, |slot| *slot = Some(1));
        assert!(reg.contains(&alice));
        assert_eq!(reg.read(&alice, |v| v.copied()), Some(1));

        reg.mutate(&alice, |slot| {
            if let Some(v) = slot.as_mut() {
                *v += 1;
            }
        });
        assert_eq!(reg.read(&alice, |v| v.copied()), Some(2));

        reg.mutate(&alice, |slot| *slot = None);
        assert!(!reg.contains(&alice));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_len_across_shards() {
        let reg: ShardedRegistry<()> = ShardedRegistry::new(4);
        for i in 0..100 {
            reg.mutate(&UserId::new(format!("u{}", i)), |slot| *slot = Some(()));
        }
        assert_eq!(reg.len(), 100);

        let mut seen = 0;
        reg.for_each(|_, _| seen += 1);
        assert_eq!(seen, 100);

        reg.retain(|k, _| k.as_str().ends_with('0'));
        assert_eq!(reg.len(), 10);
    }

    #[test]
    fn test_concurrent_mutation_of_same_key() {
        let reg: Arc<ShardedRegistry<u64>> = Arc::new(ShardedRegistry::default());
        let key = UserId::new("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        reg.mutate(&key, |slot| *slot = Some(slot.unwrap_or(0) + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(reg.read(&key, |v| v.copied()), Some(8000));
    }
}
