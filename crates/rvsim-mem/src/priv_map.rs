//! Piecewise-constant map from address to access privilege.
//!
//! Backed by a `BTreeMap` of segment start addresses; a key's value applies
//! up to (not including) the next key. Key `0` is always present, so every
//! address has a defined privilege.

use std::collections::BTreeMap;

use crate::perms::MemPriv;

#[derive(Debug, Clone)]
pub struct PrivMap {
    segments: BTreeMap<u64, MemPriv>,
}

impl PrivMap {
    pub fn new(default: MemPriv) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(0, default);
        Self { segments }
    }

    /// Privilege in force at `addr`.
    pub fn value_at(&self, addr: u64) -> MemPriv {
        *self
            .segments
            .range(..=addr)
            .next_back()
            .map(|(_, p)| p)
            .expect("segment 0 always present")
    }

    /// Intersection of the privileges over `[low, high]` inclusive.
    pub fn min_over(&self, low: u64, high: u64) -> MemPriv {
        debug_assert!(low <= high);
        let mut acc = self.value_at(low);
        for (_, p) in self.segments.range(low.saturating_add(1)..=high) {
            acc &= *p;
            if acc.is_empty() {
                break;
            }
        }
        acc
    }

    /// Ensure a segment boundary exists at `addr`.
    fn split_at(&mut self, addr: u64) {
        if addr == 0 || self.segments.contains_key(&addr) {
            return;
        }
        let value = self.value_at(addr);
        self.segments.insert(addr, value);
    }

    /// Replace the privilege of `[low, high]` inclusive.
    pub fn set(&mut self, low: u64, high: u64, p: MemPriv) {
        debug_assert!(low <= high);
        self.split_at(low);
        if let Some(next) = high.checked_add(1) {
            self.split_at(next);
        }
        let inner: Vec<u64> = self.segments.range(low..=high).map(|(k, _)| *k).collect();
        for key in inner {
            self.segments.remove(&key);
        }
        self.segments.insert(low, p);
    }

    /// Remove the bits in `p` from `[low, high]` inclusive.
    pub fn sub(&mut self, low: u64, high: u64, p: MemPriv) {
        debug_assert!(low <= high);
        self.split_at(low);
        if let Some(next) = high.checked_add(1) {
            self.split_at(next);
        }
        let keys: Vec<u64> = self.segments.range(low..=high).map(|(k, _)| *k).collect();
        for key in keys {
            if let Some(v) = self.segments.get_mut(&key) {
                *v &= !p;
            }
        }
    }
}
