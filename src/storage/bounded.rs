//! Capacity-bounded collections.
//!
//! Two eviction policies:
//!
//! - **Append-only logs** evict the oldest `max(1, capacity / 10)` entries
//!   once full, so eviction runs once per batch of inserts instead of on
//!   every insert.
//! - **Keyed maps** evict the single least-recently-updated entry, and only
//!   when the write adds a new key. Updates never evict.
//!
//! Eviction and the write happen in the same call; for the `SQLite` tables
//! that call runs inside one `IMMEDIATE` transaction so no reader observes
//! more than `capacity` entries.

use lru::LruCache;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::hash::Hash;

/// How a collection makes room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Oldest-first batch eviction.
    AppendOnly,
    /// Least-recently-updated single eviction on new keys.
    Keyed,
}

/// Number of entries to evict before a write.
///
/// `len` is the current size and `adds_entry` whether the write grows the
/// collection. Also covers collections already above capacity (for example
/// after the capacity was lowered) by evicting down to `capacity - 1`.
#[must_use]
pub fn eviction_count(policy: CapacityPolicy, capacity: usize, len: usize, adds_entry: bool) -> usize {
    let capacity = capacity.max(1);
    if !adds_entry || len < capacity {
        return 0;
    }
    let overflow = len + 1 - capacity;
    let count = match policy {
        CapacityPolicy::AppendOnly => overflow.max((capacity / 10).max(1)),
        CapacityPolicy::Keyed => overflow,
    };
    count.min(len)
}

/// A collection that enforces a capacity on every write.
pub trait BoundedCollection {
    /// What one write stores.
    type Entry;

    /// Backend error.
    type Error;

    /// Eviction policy.
    fn policy(&self) -> CapacityPolicy;

    /// Maximum entries.
    fn capacity(&self) -> usize;

    /// Current number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn len(&self) -> Result<usize, Self::Error>;

    /// Whether writing `entry` grows the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn adds_entry(&self, entry: &Self::Entry) -> Result<bool, Self::Error>;

    /// Removes up to `count` entries in eviction order; returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn evict(&mut self, count: usize) -> Result<usize, Self::Error>;

    /// Stores `entry` without any capacity check.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn write(&mut self, entry: Self::Entry) -> Result<(), Self::Error>;

    /// Evicts as the policy requires, then writes; returns the evicted count.
    ///
    /// # Errors
    ///
    /// Returns an error if eviction or the write fails.
    fn insert_or_update(&mut self, entry: Self::Entry) -> Result<usize, Self::Error> {
        let adds_entry = self.adds_entry(&entry)?;
        let count = eviction_count(self.policy(), self.capacity(), self.len()?, adds_entry);
        let evicted = if count > 0 { self.evict(count)? } else { 0 };
        self.write(entry)?;
        Ok(evicted)
    }

    /// Evicts down to capacity after bulk writes; returns the evicted count.
    ///
    /// # Errors
    ///
    /// Returns an error if eviction fails.
    fn trim_to_capacity(&mut self) -> Result<usize, Self::Error> {
        let len = self.len()?;
        let capacity = self.capacity().max(1);
        if len > capacity {
            self.evict(len - capacity)
        } else {
            Ok(0)
        }
    }
}

/// In-memory append-only log.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    /// Creates an empty log.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }
}

impl<T> BoundedCollection for BoundedLog<T> {
    type Entry = T;
    type Error = Infallible;

    fn policy(&self) -> CapacityPolicy {
        CapacityPolicy::AppendOnly
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> Result<usize, Infallible> {
        Ok(self.items.len())
    }

    fn adds_entry(&self, _entry: &T) -> Result<bool, Infallible> {
        Ok(true)
    }

    fn evict(&mut self, count: usize) -> Result<usize, Infallible> {
        let count = count.min(self.items.len());
        self.items.drain(..count);
        Ok(count)
    }

    fn write(&mut self, entry: T) -> Result<(), Infallible> {
        self.items.push_back(entry);
        Ok(())
    }
}

/// In-memory keyed map with least-recently-updated eviction.
///
/// Reads use `peek` so they never change the eviction order.
pub struct BoundedMap<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> BoundedMap<K, V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    /// Looks up a value without touching its recency.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Iterates most recently updated first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }
}

impl<K: Hash + Eq, V> BoundedCollection for BoundedMap<K, V> {
    type Entry = (K, V);
    type Error = Infallible;

    fn policy(&self) -> CapacityPolicy {
        CapacityPolicy::Keyed
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> Result<usize, Infallible> {
        Ok(self.entries.len())
    }

    fn adds_entry(&self, entry: &(K, V)) -> Result<bool, Infallible> {
        Ok(!self.entries.contains(&entry.0))
    }

    fn evict(&mut self, count: usize) -> Result<usize, Infallible> {
        let mut evicted = 0;
        while evicted < count && self.entries.pop_lru().is_some() {
            evicted += 1;
        }
        Ok(evicted)
    }

    fn write(&mut self, entry: (K, V)) -> Result<(), Infallible> {
        self.entries.put(entry.0, entry.1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CapacityPolicy::AppendOnly, 1000, 999, true, 0 ; "log below capacity")]
    #[test_case(CapacityPolicy::AppendOnly, 1000, 1000, true, 100 ; "log full evicts a tenth")]
    #[test_case(CapacityPolicy::AppendOnly, 5, 5, true, 1 ; "small log evicts at least one")]
    #[test_case(CapacityPolicy::AppendOnly, 10, 30, true, 21 ; "log over capacity evicts to fit")]
    #[test_case(CapacityPolicy::Keyed, 50, 50, true, 1 ; "map full new key evicts one")]
    #[test_case(CapacityPolicy::Keyed, 50, 50, false, 0 ; "map full update evicts nothing")]
    #[test_case(CapacityPolicy::Keyed, 50, 49, true, 0 ; "map below capacity")]
    fn test_eviction_count(policy: CapacityPolicy, capacity: usize, len: usize, adds: bool, expected: usize) {
        assert_eq!(eviction_count(policy, capacity, len, adds), expected);
    }

    #[test]
    fn test_log_evicts_oldest_batch() {
        let mut log = BoundedLog::new(20);
        for i in 0..20 {
            assert_eq!(log.insert_or_update(i).unwrap(), 0);
        }
        assert_eq!(log.insert_or_update(20).unwrap(), 2);
        assert_eq!(log.size(), 19);
        assert_eq!(log.iter().next(), Some(&2));
        assert_eq!(log.iter().last(), Some(&20));
    }

    #[test]
    fn test_map_evicts_least_recently_updated() {
        let mut map = BoundedMap::new(3);
        map.insert_or_update(("a", 1)).unwrap();
        map.insert_or_update(("b", 2)).unwrap();
        map.insert_or_update(("c", 3)).unwrap();

        // Reads do not refresh; updates do.
        assert_eq!(map.get(&"a"), Some(&1));
        assert_eq!(map.insert_or_update(("b", 20)).unwrap(), 0);

        assert_eq!(map.insert_or_update(("d", 4)).unwrap(), 1);
        assert_eq!(map.get(&"a"), None);
        assert_eq!(map.get(&"b"), Some(&20));
        assert_eq!(map.size(), 3);
    }

    #[test]
    fn test_trim_to_capacity_after_bulk_writes() {
        let mut log = BoundedLog::new(5);
        for i in 0..8 {
            log.write(i).unwrap();
        }
        assert_eq!(log.trim_to_capacity().unwrap(), 3);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);
        assert_eq!(log.trim_to_capacity().unwrap(), 0);
    }
}
