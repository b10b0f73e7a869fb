use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

#[derive(Debug)]
struct IdleItem<V> {
    value: V,
    instant: Instant,
}

/// A pool of reusable resources keyed by their layout.
///
/// Items are checked out by value and must be handed back with [`ResourcePool::release`];
/// the pool keeps count of items that are currently out.
/// Items left idle for longer than the pool's duration are dropped.
#[allow(clippy::type_complexity)]
#[derive(Debug)]
pub struct ResourcePool<K, V> {
    duration: Duration,
    map: Arc<Mutex<HashMap<K, Vec<IdleItem<V>>>>>,
    outstanding: Arc<AtomicUsize>,
}

impl<K, V> Clone for ResourcePool<K, V> {
    fn clone(&self) -> Self {
        Self {
            duration: self.duration,
            map: self.map.clone(),
            outstanding: self.outstanding.clone(),
        }
    }
}

impl<K, V> Default for ResourcePool<K, V> {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            map: Default::default(),
            outstanding: Default::default(),
        }
    }
}

impl<K, V> ResourcePool<K, V>
where
    K: PartialEq + Eq + Hash,
{
    /// Note: If `duration` is 0, the pool won't evict any items.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    fn evict(&self, map: &mut HashMap<K, Vec<IdleItem<V>>>) {
        if self.duration.is_zero() {
            return;
        }
        for items in map.values_mut() {
            items.retain(|item| item.instant.elapsed() < self.duration);
        }
        map.retain(|_, items| !items.is_empty());
    }

    /// Checkout an item with the given key. If there is no free one, `f` is called to construct it.
    pub fn checkout(&self, key: K, f: impl FnOnce() -> V) -> V {
        let item = self.map.lock().ok().and_then(|mut map| {
            self.evict(&mut map);
            map.get_mut(&key).and_then(Vec::pop)
        });
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        match item {
            Some(IdleItem { value, .. }) => value,
            None => f(),
        }
    }

    /// Hand an item back so that later checkouts can reuse it.
    pub fn release(&self, key: K, value: V) {
        if let Ok(mut map) = self.map.lock() {
            self.evict(&mut map);
            let instant = Instant::now();
            map.entry(key).or_default().push(IdleItem { value, instant });
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of items checked out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle items kept by the pool.
    pub fn idle(&self) -> usize {
        self.map
            .lock()
            .map(|map| map.values().map(Vec::len).sum())
            .unwrap_or_default()
    }
}
