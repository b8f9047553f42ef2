//! Lock-free whole-value swap containers. Session state that is read on every packet (cipher
//!  keys, base-time offsets, the active signal index cache, the connection registry) is never
//!  mutated in place: writers install a fresh immutable snapshot, so a concurrent reader
//!  always observes either the old or the new value, never a mix. Reclamation of the old
//!  snapshot is deferred until the last reader is gone, which is exactly what `arc-swap`
//!  provides.

use std::hash::Hash;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use rustc_hash::FxHashMap;

pub struct AtomicMap<K, V> {
    map: ArcSwap<FxHashMap<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load().get(key).cloned()
    }

    /// A consistent snapshot of the whole map, e.g. for the rotation timer visiting all
    ///  connections.
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.map.load_full()
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        self.map.rcu(|old| {
            let mut map = (**old).clone();
            f(&mut map);
            map
        });
    }
}

/// A single optional value replaced wholesale. This is the Rust rendering of the
///  'volatile array replace' idiom: `set` installs a new snapshot, `get` hands out a cheap
///  `Arc` clone of whatever was current at that instant.
pub struct AtomicValue<T> {
    value: ArcSwapOption<T>,
}

impl<T> Default for AtomicValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AtomicValue<T> {
    pub fn new() -> AtomicValue<T> {
        AtomicValue {
            value: ArcSwapOption::empty(),
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.load_full()
    }

    pub fn set(&self, new_value: T) {
        self.value.store(Some(Arc::new(new_value)));
    }

    /// Installs an already-shared value, so the caller can keep a handle to exactly what was
    ///  stored.
    pub fn set_arc(&self, new_value: Arc<T>) {
        self.value.store(Some(new_value));
    }

    pub fn clear(&self) {
        self.value.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_map_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));

        map.update(|m| {
            m.remove(&1);
        });
        assert_eq!(None, map.get(&1));
    }

    #[test]
    fn test_map_snapshot() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 10);
            m.insert(2, 20);
        });

        let snapshot = map.snapshot();
        map.update(|m| {
            m.insert(3, 30);
        });

        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.snapshot().len(), 3);
    }

    #[test]
    fn test_value_set_get_clear() {
        let value = AtomicValue::<(u64, u64)>::new();
        assert!(value.get().is_none());

        value.set((1, 2));
        assert_eq!(value.get().as_deref(), Some(&(1, 2)));

        value.set((3, 4));
        assert_eq!(value.get().as_deref(), Some(&(3, 4)));

        value.clear();
        assert!(value.get().is_none());
    }

    #[test]
    fn test_value_set_arc_stores_the_given_handle() {
        let value = AtomicValue::<u64>::new();
        let shared = Arc::new(7);
        value.set_arc(shared.clone());
        assert!(Arc::ptr_eq(&value.get().unwrap(), &shared));
    }

    #[test]
    fn test_value_reader_sees_consistent_snapshot() {
        // a reader holding an Arc is unaffected by later replacements
        let value = AtomicValue::<Vec<u64>>::new();
        value.set(vec![1, 1]);

        let snapshot = value.get().unwrap();
        value.set(vec![2, 2]);

        assert_eq!(snapshot.as_ref(), &vec![1, 1]);
        assert_eq!(value.get().unwrap().as_ref(), &vec![2, 2]);
    }

    #[test]
    fn test_value_concurrent_readers_and_writer() {
        let value = Arc::new(AtomicValue::<Vec<u64>>::new());
        value.set(vec![0, 0]);

        let writer = {
            let value = value.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    value.set(vec![i, i]);
                }
            })
        };
        let reader = {
            let value = value.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let snapshot = value.get().unwrap();
                    assert_eq!(snapshot[0], snapshot[1]);
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_map_concurrent_readers_and_writer() {
        let map = Arc::new(AtomicMap::<u64, u64>::new());

        let writer = {
            let map = map.clone();
            std::thread::spawn(move || {
                for i in 0..5_000u64 {
                    map.update(|m| {
                        m.insert(i % 16, i);
                    });
                }
            })
        };
        let reader = {
            let map = map.clone();
            std::thread::spawn(move || {
                for _ in 0..5_000 {
                    let _ = map.get(&3);
                    let _ = map.snapshot();
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
