// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! First In First Out queue of keyed values that prevents duplicate keys.
//!
//! Backs the in-memory transaction pool: keys are transaction hashes, values
//! are the pending entries, iteration follows arrival order.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Queue Set structure.
#[derive(Debug)]
pub struct QueueSet<K, V> {
    /// Map for quick presence check and value lookup.
    map: HashMap<K, V>,
    /// Keys sorted by arrival time.
    fifo: VecDeque<K>,
}

impl<K, V> Default for QueueSet<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
            fifo: VecDeque::default(),
        }
    }
}

impl<K, V> QueueSet<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Instance a new empty QueueSet structure.
    ///
    /// # Example
    ///
    /// ```
    /// # use trinci_raft::base::queue_set::QueueSet;
    /// let queue: QueueSet<u32, &str> = QueueSet::new();
    /// assert!(queue.is_empty());
    /// ```
    pub fn new() -> Self {
        QueueSet::default()
    }

    /// Get the number of entries in the queue.
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Checks if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if the queue contains the given key.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Adds the given key/value pair to the queue.
    ///
    /// If the key is already present returns false and the previous value is retained.
    ///
    /// # Example
    ///
    /// ```
    /// # use trinci_raft::base::queue_set::QueueSet;
    /// let mut queue = QueueSet::new();
    /// assert!(queue.push(1, "a"));
    /// assert!(!queue.push(1, "b"));
    /// assert_eq!(queue.get(&1), Some(&"a"));
    /// ```
    pub fn push(&mut self, key: K, val: V) -> bool {
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key.clone(), val);
        self.fifo.push_back(key);
        true
    }

    /// Get a reference to the value associated with the key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Removes and returns the least recently inserted key/value pair.
    pub fn pop(&mut self) -> Option<(K, V)> {
        let key = self.fifo.pop_front()?;
        self.map.remove(&key).map(|val| (key, val))
    }

    /// Removes an element by key, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let val = self.map.remove(key)?;
        if let Some(pos) = self.fifo.iter().position(|k| k == key) {
            self.fifo.remove(pos);
        }
        Some(val)
    }

    /// Removes every key in `keys` with a single pass over the queue.
    /// Returns the number of removed entries.
    pub fn remove_all(&mut self, keys: &[K]) -> usize {
        let before = self.map.len();
        for key in keys {
            self.map.remove(key);
        }
        let map = &self.map;
        self.fifo.retain(|k| map.contains_key(k));
        before - self.map.len()
    }

    /// Iterator over the values in arrival order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.fifo.iter().filter_map(move |k| self.map.get(k))
    }
}
