// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Insertion-ordered map that evicts its oldest entry past `max_len`.
pub struct BoundedMap<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    max_len: usize,
}

impl<K, V> BoundedMap<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_len: max_len.max(1),
        }
    }

    /// Insert or overwrite. Returns `true` only for first-seen keys.
    pub fn remember(&mut self, key: K, value: V) -> bool {
        if self.entries.insert(key, value).is_some() {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.max_len
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        true
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
