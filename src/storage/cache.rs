// src/storage/cache.rs
//
// Small in-memory LRU over recently read evidence, bounded by total bytes.

use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct ByteCache {
    max_bytes: usize,
    used: usize,
    entries: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ByteCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            used: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some(v) => {
                let v = v.clone();
                self.touch(key);
                self.hits += 1;
                Some(v)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Payloads larger than the whole cache are not cached.
    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        if value.len() > self.max_bytes {
            return;
        }
        self.remove(key);
        while self.used + value.len() > self.max_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(old) = self.entries.remove(&oldest) {
                self.used -= old.len();
            }
        }
        self.used += value.len();
        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.remove(key) {
            self.used -= old.len();
            self.order.retain(|k| k != key);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            used_bytes: self.used,
            hits: self.hits,
            misses: self.misses,
        }
    }
}
