use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

/// Insertion-ordered map. Iteration yields values oldest-first; neither
/// lookups nor size queries disturb the order.
pub struct OrderedMap<K, V> {
    inner: Mutex<OrderedInner<K, V>>,
}

struct OrderedInner<K, V> {
    order: VecDeque<K>,
    map: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OrderedInner {
                order: VecDeque::new(),
                map: HashMap::new(),
            }),
        }
    }

    /// Insert unless present. Returns the existing value on conflict.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.map.get(&key) {
            return Some(existing.clone());
        }

        inner.order.push_back(key.clone());
        inner.map.insert(key, value);
        None
    }

    /// Insert, replacing and returning any previous value. A replaced
    /// entry keeps its original position in the order.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();

        let previous = inner.map.insert(key.clone(), value);

        if previous.is_none() {
            inner.order.push_back(key);
        }

        previous
    }

    /// Remove the entry only when the stored value satisfies `matches`.
    pub fn remove_if<F: FnOnce(&V) -> bool>(&self, key: &K, matches: F) -> Option<V> {
        let mut inner = self.inner.lock();

        match inner.map.get(key) {
            Some(value) if matches(value) => {
                let removed = inner.map.remove(key);
                inner.order.retain(|k| k != key);
                removed
            }
            _ => None,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().map.get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();

        let removed = inner.map.remove(key);

        if removed.is_some() {
            inner.order.retain(|k| k != key);
        }

        removed
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    /// Values in insertion order.
    pub fn values(&self) -> Vec<V> {
        let inner = self.inner.lock();

        inner
            .order
            .iter()
            .filter_map(|k| inner.map.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded insertion-ordered map. When full, inserting evicts the oldest
/// entry by insertion time.
pub struct BoundedOrderedMap<K, V> {
    capacity: usize,
    inner: Mutex<OrderedInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedOrderedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");

        Self {
            capacity,
            inner: Mutex::new(OrderedInner {
                order: VecDeque::new(),
                map: HashMap::new(),
            }),
        }
    }

    /// Insert unless present, evicting the oldest entry when at capacity.
    /// Returns the existing value on conflict.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.map.get(&key) {
            return Some(existing.clone());
        }

        if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.map.insert(key, value);
        None
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().map.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.map.clear();
    }
}

/// Bounded insertion-ordered set with the same eviction rule.
pub struct BoundedOrderedSet<K> {
    map: BoundedOrderedMap<K, ()>,
}

impl<K: Eq + Hash + Clone> BoundedOrderedSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: BoundedOrderedMap::new(capacity),
        }
    }

    /// Returns `false` if the key was already present.
    pub fn add(&self, key: K) -> bool {
        self.map.put_if_absent(key, ()).is_none()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
