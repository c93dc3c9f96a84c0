//! Reference-counted cache of expensive, immutable device objects.
//!
//! An [`ObjectCache`] maps a creation-parameter key to a lazily constructed
//! object. Every [`ObjectCache::get`] takes a reference and every
//! [`ObjectCache::release`] gives one back; the object is destroyed and its
//! entry removed on the transition to zero references.
//!
//! Construction happens outside the map lock. The first thread to miss on a
//! key inserts an in-progress slot before constructing, so concurrent misses
//! on the same key wait for that one construction instead of racing.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{GpuError, Result};
use crate::task::Pending;

/// Builds and destroys the objects held by an [`ObjectCache`].
pub trait CachedObjectFactory: Send + Sync + 'static {
    /// Every field the constructed value depends on; equal keys share one object.
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    /// Usually a `Copy` native handle.
    type Value: Clone + Send + Sync + 'static;

    /// Construct the object for `key`. Called at most once per live entry.
    fn create_cached(&self, key: &Self::Key) -> Result<Self::Value>;

    /// Destroy an object whose last reference was released.
    fn destroy_cached(&self, key: &Self::Key, value: Self::Value);
}

enum SlotState<V> {
    Constructing,
    Ready(V),
    Failed(GpuError),
}

/// Construction result shared by every holder of a key.
struct Slot<V> {
    state: Mutex<SlotState<V>>,
    resolved: Condvar,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Constructing),
            resolved: Condvar::new(),
        }
    }

    fn resolve(&self, result: Result<V>) {
        *self.state.lock() = match result {
            Ok(value) => SlotState::Ready(value),
            Err(e) => SlotState::Failed(e),
        };
        self.resolved.notify_all();
    }

    fn wait(&self) -> Result<V> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Constructing => self.resolved.wait(&mut state),
                SlotState::Ready(value) => return Ok(value.clone()),
                SlotState::Failed(e) => return Err(e.clone()),
            }
        }
    }
}

struct CacheEntry<V> {
    slot: Arc<Slot<V>>,
    ref_count: u64,
}

/// Reference-counted object cache.
pub struct ObjectCache<F: CachedObjectFactory> {
    name: &'static str,
    factory: F,
    entries: Mutex<HashMap<F::Key, CacheEntry<F::Value>>>,
}

impl<F: CachedObjectFactory> ObjectCache<F> {
    /// Create an empty cache. `name` only appears in logs.
    pub fn new(name: &'static str, factory: F) -> Self {
        Self {
            name,
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The factory that builds this cache's objects.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get the object for `key`, constructing it on first use.
    ///
    /// Takes one reference whether the call hit or missed. If construction
    /// fails, the error reaches this caller and every caller waiting on the
    /// same key, and no entry is retained.
    pub fn get(&self, key: &F::Key) -> Result<F::Value> {
        let (slot, constructor) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                entry.ref_count += 1;
                (Arc::clone(&entry.slot), false)
            } else {
                let slot = Arc::new(Slot::new());
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        slot: Arc::clone(&slot),
                        ref_count: 1,
                    },
                );
                (slot, true)
            }
        };

        if !constructor {
            return slot.wait();
        }

        let mut guard = ConstructionGuard {
            cache: self,
            key,
            slot: &slot,
            armed: true,
        };
        let result = self.factory.create_cached(key);
        guard.armed = false;

        match &result {
            Ok(_) => tracing::debug!("{}: constructed {:?}", self.name, key),
            Err(e) => {
                tracing::warn!("{}: construction of {:?} failed: {}", self.name, key, e);
                self.forget(key, &slot);
            }
        }
        slot.resolve(result.clone());
        result
    }

    /// [`Self::get`] on a background thread.
    pub fn get_async(self: &Arc<Self>, key: F::Key) -> Pending<F::Value> {
        let cache = Arc::clone(self);
        Pending::spawn("cinder-cache", move || cache.get(&key))
    }

    /// Give back one reference taken by [`Self::get`].
    ///
    /// Unknown keys are ignored. Releasing the last reference destroys the
    /// object; a later `get` of the same key constructs a fresh one.
    pub fn release(&self, key: &F::Key) {
        let evicted = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return;
            }
            entries.remove(key).map(|entry| entry.slot)
        };

        if let Some(slot) = evicted {
            if let Ok(value) = slot.wait() {
                tracing::debug!("{}: destroying {:?}", self.name, key);
                self.factory.destroy_cached(key, value);
            }
        }
    }

    /// Current reference count for `key`, if it has a live entry.
    pub fn ref_count(&self, key: &F::Key) -> Option<u64> {
        self.entries.lock().get(key).map(|entry| entry.ref_count)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Destroy every live object regardless of outstanding references.
    ///
    /// Only for owner teardown, once no holder can use its objects anymore.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("{}: clearing {} entries", self.name, drained.len());
        }
        for (key, entry) in drained {
            if let Ok(value) = entry.slot.wait() {
                self.factory.destroy_cached(&key, value);
            }
        }
    }

    /// Drop the entry for `key` if it still belongs to `slot`.
    fn forget(&self, key: &F::Key, slot: &Arc<Slot<F::Value>>) {
        let mut entries = self.entries.lock();
        if entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
        {
            entries.remove(key);
        }
    }
}

impl<F: CachedObjectFactory> Drop for ObjectCache<F> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Resolves the slot as failed if construction unwinds, so waiters never hang.
struct ConstructionGuard<'a, F: CachedObjectFactory> {
    cache: &'a ObjectCache<F>,
    key: &'a F::Key,
    slot: &'a Arc<Slot<F::Value>>,
    armed: bool,
}

impl<F: CachedObjectFactory> Drop for ConstructionGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.forget(self.key, self.slot);
            self.slot.resolve(Err(GpuError::InvalidState(format!(
                "{}: construction of {:?} panicked",
                self.cache.name, self.key
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingFactory {
        next: AtomicU64,
        created: AtomicU64,
        destroyed: Mutex<Vec<(u32, u64)>>,
        delay: Option<Duration>,
    }

    impl CachedObjectFactory for CountingFactory {
        type Key = u32;
        type Value = u64;

        fn create_cached(&self, key: &u32) -> Result<u64> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if *key == u32::MAX {
                return Err(GpuError::Vulkan(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.fetch_add(1, Ordering::SeqCst) + 100)
        }

        fn destroy_cached(&self, key: &u32, value: u64) {
            self.destroyed.lock().push((*key, value));
        }
    }

    #[test]
    fn equal_keys_share_one_object() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        let a = cache.get(&7).unwrap();
        let b = cache.get(&7).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.factory().created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ref_count(&7), Some(2));
    }

    #[test]
    fn distinct_keys_get_distinct_objects() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        assert_ne!(cache.get(&1).unwrap(), cache.get(&2).unwrap());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn matched_get_release_pairs_restore_ref_count() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        cache.get(&3).unwrap();
        for _ in 0..10 {
            cache.get(&3).unwrap();
        }
        for _ in 0..10 {
            cache.release(&3);
        }
        assert_eq!(cache.ref_count(&3), Some(1));
        assert!(cache.factory().destroyed.lock().is_empty());
    }

    #[test]
    fn last_release_destroys_and_removes() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        let value = cache.get(&5).unwrap();
        cache.release(&5);
        assert_eq!(cache.ref_count(&5), None);
        assert!(cache.is_empty());
        assert_eq!(*cache.factory().destroyed.lock(), vec![(5, value)]);

        let fresh = cache.get(&5).unwrap();
        assert_ne!(fresh, value);
    }

    #[test]
    fn releasing_unknown_key_is_a_no_op() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        cache.release(&42);
        assert!(cache.is_empty());
        assert!(cache.factory().destroyed.lock().is_empty());
    }

    #[test]
    fn failed_construction_leaves_no_entry() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        let err = cache.get(&u32::MAX).unwrap_err();
        assert_eq!(
            err,
            GpuError::Vulkan(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(cache.ref_count(&u32::MAX), None);
    }

    #[test]
    fn concurrent_misses_construct_once() {
        let factory = CountingFactory {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let cache = Arc::new(ObjectCache::new("test", factory));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&9).unwrap()
                })
            })
            .collect();
        let values: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(values.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.factory().created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ref_count(&9), Some(8));
    }

    #[test]
    fn async_get_matches_sync_get() {
        let cache = Arc::new(ObjectCache::new("test", CountingFactory::default()));
        let sync_value = cache.get(&11).unwrap();
        let async_value = cache.get_async(11).wait().unwrap();
        assert_eq!(sync_value, async_value);
        assert_eq!(cache.ref_count(&11), Some(2));
    }

    #[test]
    fn clear_destroys_everything() {
        let cache = ObjectCache::new("test", CountingFactory::default());
        cache.get(&1).unwrap();
        cache.get(&2).unwrap();
        cache.get(&2).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.factory().destroyed.lock().len(), 2);
    }
}
