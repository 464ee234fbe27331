// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/05/07 11:13:02

use std::collections::VecDeque;

use xxhash_rust::xxh32::Xxh32;

use crate::DYNAMIC_ENTRY_OVERHEAD;

#[derive(Debug)]
pub(crate) struct IndexEntry {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub abs_id: u64,
    pub name_hash: u32,
    pub nameval_hash: u32,
    /// References held by unacked header blocks and by the block being
    /// built; a referenced entry must not be evicted.
    pub reffd: u32,
}

impl IndexEntry {
    pub fn cost(&self) -> usize {
        DYNAMIC_ENTRY_OVERHEAD + self.name.len() + self.value.len()
    }
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    by_name: Vec<u64>,
    by_nameval: Vec<u64>,
}

/// The encoder's dynamic table: entries in insertion order with monotone
/// absolute ids, indexed twice by hash chains so both name+value and
/// name-only lookups are cheap. Hashes are seeded per instance so remote
/// input cannot aim for one bucket.
#[derive(Debug)]
pub struct HeaderIndex {
    entries: VecDeque<IndexEntry>,
    ins_count: u64,
    del_count: u64,
    buckets: Vec<Bucket>,
    nbits: u32,
    size: usize,
    max_capacity: usize,
    seed: u32,
}

impl HeaderIndex {
    pub fn new(max_capacity: usize) -> HeaderIndex {
        HeaderIndex {
            entries: VecDeque::new(),
            ins_count: 0,
            del_count: 0,
            buckets: vec![Bucket::default(); 4],
            nbits: 2,
            size: 0,
            max_capacity,
            seed: rand::random(),
        }
    }

    pub fn ins_count(&self) -> u64 {
        self.ins_count
    }

    pub fn current_size(&self) -> usize {
        self.size
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn hash_pair(&self, name: &[u8], value: &[u8]) -> (u32, u32) {
        let mut state = Xxh32::new(self.seed);
        state.update(name);
        let name_hash = state.digest();
        state.update(value);
        (name_hash, state.digest())
    }

    fn bucket_no(&self, hash: u32) -> usize {
        (hash & ((1u32 << self.nbits) - 1)) as usize
    }

    pub(crate) fn get(&self, abs_id: u64) -> Option<&IndexEntry> {
        if abs_id > self.del_count && abs_id <= self.ins_count {
            self.entries.get((abs_id - self.del_count - 1) as usize)
        } else {
            None
        }
    }

    fn get_mut(&mut self, abs_id: u64) -> Option<&mut IndexEntry> {
        if abs_id > self.del_count && abs_id <= self.ins_count {
            self.entries.get_mut((abs_id - self.del_count - 1) as usize)
        } else {
            None
        }
    }

    pub(crate) fn ref_entry(&mut self, abs_id: u64) {
        if let Some(entry) = self.get_mut(abs_id) {
            entry.reffd += 1;
        }
    }

    pub(crate) fn unref_entry(&mut self, abs_id: u64) {
        if let Some(entry) = self.get_mut(abs_id) {
            entry.reffd = entry.reffd.saturating_sub(1);
        }
    }

    /// Name+value lookup. `risk` admits entries the peer has not yet
    /// acknowledged; `cutoff` hides entries that the current header block
    /// has promised the eviction path it will not reference.
    pub(crate) fn find_nameval(
        &self,
        name: &[u8],
        value: &[u8],
        nameval_hash: u32,
        risk: bool,
        max_acked: u64,
        cutoff: u64,
    ) -> Option<u64> {
        let bucket = &self.buckets[self.bucket_no(nameval_hash)];
        for &id in bucket.by_nameval.iter() {
            let entry = match self.get(id) {
                Some(v) => v,
                None => continue,
            };
            if entry.nameval_hash == nameval_hash
                && (risk || id <= max_acked)
                && (cutoff == 0 || id > cutoff)
                && entry.name == name
                && entry.value == value
            {
                return Some(id);
            }
        }
        None
    }

    /// Name-only lookup with the same gates as `find_nameval`.
    pub(crate) fn find_name(
        &self,
        name: &[u8],
        name_hash: u32,
        risk: bool,
        max_acked: u64,
        cutoff: u64,
    ) -> Option<u64> {
        let bucket = &self.buckets[self.bucket_no(name_hash)];
        for &id in bucket.by_name.iter() {
            let entry = match self.get(id) {
                Some(v) => v,
                None => continue,
            };
            if entry.name_hash == name_hash
                && (risk || id <= max_acked)
                && (cutoff == 0 || id > cutoff)
                && entry.name == name
            {
                return Some(id);
            }
        }
        None
    }

    /// Checks that inserting an entry of `extra` bytes could succeed by
    /// evicting only unreferenced entries. Returns the largest absolute id
    /// the eviction would remove (`0` when no eviction is needed), so the
    /// caller can stop referencing entries at or below it.
    pub(crate) fn can_evict_at_least(&self, extra: usize) -> Option<u64> {
        let mut avail = self.max_capacity.saturating_sub(self.size);
        if avail >= extra {
            return Some(0);
        }
        let mut cutoff = 0;
        for entry in self.entries.iter() {
            if entry.reffd > 0 {
                return None;
            }
            avail += entry.cost();
            cutoff = entry.abs_id;
            if avail >= extra {
                return Some(cutoff);
            }
        }
        None
    }

    /// Appends a new entry, growing the hash buckets at half load, and
    /// evicts whatever unreferenced prefix no longer fits.
    pub(crate) fn insert(&mut self, name: &[u8], value: &[u8]) -> u64 {
        if self.entries.len() >= self.buckets.len() / 2 {
            self.grow_buckets();
        }
        let (name_hash, nameval_hash) = self.hash_pair(name, value);
        self.ins_count += 1;
        let entry = IndexEntry {
            name: name.to_vec(),
            value: value.to_vec(),
            abs_id: self.ins_count,
            name_hash,
            nameval_hash,
            reffd: 0,
        };
        self.size += entry.cost();
        let abs_id = entry.abs_id;
        let name_bucket = self.bucket_no(name_hash);
        let nameval_bucket = self.bucket_no(nameval_hash);
        self.buckets[name_bucket].by_name.push(abs_id);
        self.buckets[nameval_bucket]
            .by_nameval
            .push(abs_id);
        self.entries.push_back(entry);
        self.remove_overflow();
        abs_id
    }

    fn grow_buckets(&mut self) {
        // The hash is stable, so doubling is a partition by one more bit.
        self.nbits += 1;
        let mut buckets = vec![Bucket::default(); 1 << self.nbits];
        for entry in self.entries.iter() {
            buckets[(entry.name_hash & ((1u32 << self.nbits) - 1)) as usize]
                .by_name
                .push(entry.abs_id);
            buckets[(entry.nameval_hash & ((1u32 << self.nbits) - 1)) as usize]
                .by_nameval
                .push(entry.abs_id);
        }
        self.buckets = buckets;
    }

    pub(crate) fn remove_overflow(&mut self) {
        while self.size > self.max_capacity {
            match self.entries.front() {
                Some(entry) if entry.reffd == 0 => {}
                _ => return,
            }
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            log::trace!("qpack: evict entry {}", entry.abs_id);
            let no = self.bucket_no(entry.name_hash);
            if let Some(pos) = self.buckets[no].by_name.iter().position(|&x| x == entry.abs_id) {
                self.buckets[no].by_name.remove(pos);
            }
            let no = self.bucket_no(entry.nameval_hash);
            if let Some(pos) = self.buckets[no]
                .by_nameval
                .iter()
                .position(|&x| x == entry.abs_id)
            {
                self.buckets[no].by_nameval.remove(pos);
            }
            self.size -= entry.cost();
            self.del_count += 1;
        }
    }

    pub fn set_max_capacity(&mut self, max_capacity: usize) {
        self.max_capacity = max_capacity;
        self.remove_overflow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_pair(index: &HeaderIndex, name: &[u8], value: &[u8]) -> (Option<u64>, Option<u64>) {
        let (name_hash, nameval_hash) = index.hash_pair(name, value);
        (
            index.find_nameval(name, value, nameval_hash, true, 0, 0),
            index.find_name(name, name_hash, true, 0, 0),
        )
    }

    #[test]
    fn test_insert_and_find() {
        let mut index = HeaderIndex::new(4096);
        assert_eq!(index.insert(b"x-foo", b"bar"), 1);
        assert_eq!(index.insert(b"x-foo", b"baz"), 2);

        let (nameval, name) = find_pair(&index, b"x-foo", b"bar");
        assert_eq!(nameval, Some(1));
        assert!(name.is_some());
        let (nameval, _) = find_pair(&index, b"x-foo", b"nope");
        assert_eq!(nameval, None);
        let (nameval, name) = find_pair(&index, b"y-foo", b"bar");
        assert_eq!(nameval, None);
        assert_eq!(name, None);
    }

    #[test]
    fn test_risk_gate() {
        let mut index = HeaderIndex::new(4096);
        index.insert(b"x-foo", b"bar");
        let (_, nameval_hash) = index.hash_pair(b"x-foo", b"bar");
        // Unacked entry is only visible when risking is allowed.
        assert_eq!(index.find_nameval(b"x-foo", b"bar", nameval_hash, false, 0, 0), None);
        assert_eq!(
            index.find_nameval(b"x-foo", b"bar", nameval_hash, false, 1, 0),
            Some(1)
        );
    }

    #[test]
    fn test_eviction_fifo() {
        // Each entry costs 32 + 5 + 3 = 40.
        let mut index = HeaderIndex::new(80);
        index.insert(b"x-foo", b"ba1");
        index.insert(b"x-foo", b"ba2");
        index.insert(b"x-foo", b"ba3");
        assert_eq!(index.len(), 2);
        assert!(index.current_size() <= 80);
        assert!(index.get(1).is_none());
        assert!(index.get(2).is_some());
        let (nameval, _) = find_pair(&index, b"x-foo", b"ba1");
        assert_eq!(nameval, None);
    }

    #[test]
    fn test_referenced_not_evicted() {
        let mut index = HeaderIndex::new(80);
        index.insert(b"x-foo", b"ba1");
        index.ref_entry(1);
        assert_eq!(index.can_evict_at_least(60), None);
        index.insert(b"x-foo", b"ba2");
        index.insert(b"x-foo", b"ba3");
        // The referenced head stalls FIFO eviction.
        assert!(index.get(1).is_some());
        index.unref_entry(1);
        index.remove_overflow();
        assert!(index.get(1).is_none());
        assert!(index.current_size() <= 80);
    }

    #[test]
    fn test_bucket_growth_keeps_lookups() {
        let mut index = HeaderIndex::new(1 << 20);
        for i in 0..64u32 {
            index.insert(format!("x-h-{}", i).as_bytes(), b"v");
        }
        for i in 0..64u32 {
            let name = format!("x-h-{}", i);
            let (nameval, _) = find_pair(&index, name.as_bytes(), b"v");
            assert_eq!(nameval, Some(i as u64 + 1));
        }
    }

    #[test]
    fn test_evict_cutoff() {
        let mut index = HeaderIndex::new(120);
        index.insert(b"x-foo", b"ba1");
        index.insert(b"x-foo", b"ba2");
        index.insert(b"x-foo", b"ba3");
        // Room for one more 40-byte entry requires evicting entry 1.
        assert_eq!(index.can_evict_at_least(40), Some(1));
        assert_eq!(index.can_evict_at_least(120), Some(3));
        assert_eq!(index.can_evict_at_least(121), None);
    }
}
