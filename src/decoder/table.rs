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
// Created Date: 2024/05/08 14:46:09

use std::collections::VecDeque;

use algorithm::buf::{Binary, Bt};

use crate::DYNAMIC_ENTRY_OVERHEAD;

/// One dynamic table entry. Name and value are shared buffers: cloning an
/// entry into a decoded header keeps the bytes alive past eviction, which
/// is the reference-counting discipline the protocol asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub name: Binary,
    pub value: Binary,
}

impl TableEntry {
    pub fn new(name: Binary, value: Binary) -> TableEntry {
        TableEntry { name, value }
    }

    pub fn cost(&self) -> usize {
        DYNAMIC_ENTRY_OVERHEAD + self.name.remaining() + self.value.remaining()
    }
}

/// The decoder's dynamic table: a FIFO of entries with monotone absolute
/// ids reconstructed by counting insertions. The deletion counter turns an
/// absolute id into a deque offset.
#[derive(Debug)]
pub struct HeaderTable {
    table: VecDeque<TableEntry>,
    ins_count: u64,
    del_count: u64,
    size: usize,
    /// Limit from the local configuration; instructions may not raise the
    /// capacity past it.
    max_capacity: usize,
    /// Current capacity as set by the peer's instructions.
    cur_max_capacity: usize,
}

impl HeaderTable {
    pub fn new(max_capacity: usize) -> HeaderTable {
        HeaderTable {
            table: VecDeque::new(),
            ins_count: 0,
            del_count: 0,
            size: 0,
            max_capacity,
            cur_max_capacity: max_capacity,
        }
    }

    pub fn ins_count(&self) -> u64 {
        self.ins_count
    }

    pub fn del_count(&self) -> u64 {
        self.del_count
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn current_size(&self) -> usize {
        self.size
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn cur_max_capacity(&self) -> usize {
        self.cur_max_capacity
    }

    /// Relative lookup where 0 is the newest entry.
    pub fn get_rel(&self, rel_idx: u64) -> Option<&TableEntry> {
        let count = self.table.len() as u64;
        if rel_idx < count {
            self.table.get((count - 1 - rel_idx) as usize)
        } else {
            None
        }
    }

    /// Absolute lookup; fails for evicted or not-yet-inserted ids.
    pub fn get_abs(&self, abs_id: u64) -> Option<&TableEntry> {
        if abs_id > self.del_count && abs_id <= self.ins_count {
            self.table.get((abs_id - self.del_count - 1) as usize)
        } else {
            None
        }
    }

    /// Appends an entry, evicting from the front until the table fits.
    /// Returns the new entry's absolute id.
    pub fn push(&mut self, entry: TableEntry) -> u64 {
        self.size += entry.cost();
        self.table.push_back(entry);
        self.ins_count += 1;
        self.remove_overflow();
        self.ins_count
    }

    pub fn drop_oldest(&mut self) {
        if let Some(entry) = self.table.pop_front() {
            log::trace!("qpack: decoder evicts entry {}", self.del_count + 1);
            self.size -= entry.cost();
            self.del_count += 1;
        }
    }

    fn remove_overflow(&mut self) {
        while self.size > self.cur_max_capacity {
            self.drop_oldest();
        }
    }

    /// Applies a set-capacity instruction; the caller validated it against
    /// the configured maximum.
    pub fn update_cur_max_capacity(&mut self, capacity: usize) {
        self.cur_max_capacity = capacity;
        self.remove_overflow();
    }

    /// Changes the configured limit itself.
    pub fn set_max_capacity(&mut self, capacity: usize) {
        self.max_capacity = capacity;
        self.update_cur_max_capacity(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, value: &str) -> TableEntry {
        TableEntry::new(
            Binary::from(name.as_bytes().to_vec()),
            Binary::from(value.as_bytes().to_vec()),
        )
    }

    #[test]
    fn test_push_and_lookup() {
        let mut table = HeaderTable::new(4096);
        assert_eq!(table.push(entry("x-foo", "ba1")), 1);
        assert_eq!(table.push(entry("x-foo", "ba2")), 2);

        assert_eq!(table.get_abs(1).map(|e| e.value.chunk()), Some(&b"ba1"[..]));
        assert_eq!(table.get_rel(0).map(|e| e.value.chunk()), Some(&b"ba2"[..]));
        assert_eq!(table.get_rel(1).map(|e| e.value.chunk()), Some(&b"ba1"[..]));
        assert!(table.get_rel(2).is_none());
        assert!(table.get_abs(0).is_none());
        assert!(table.get_abs(3).is_none());
    }

    #[test]
    fn test_eviction_and_abs_ids() {
        // Each entry costs 40 bytes.
        let mut table = HeaderTable::new(80);
        table.push(entry("x-foo", "ba1"));
        table.push(entry("x-foo", "ba2"));
        table.push(entry("x-foo", "ba3"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.del_count(), 1);
        assert!(table.get_abs(1).is_none());
        assert_eq!(table.get_abs(2).map(|e| e.value.chunk()), Some(&b"ba2"[..]));
        assert_eq!(table.get_abs(3).map(|e| e.value.chunk()), Some(&b"ba3"[..]));
    }

    #[test]
    fn test_entry_outlives_eviction() {
        let mut table = HeaderTable::new(40);
        table.push(entry("x-foo", "ba1"));
        let kept = table.get_abs(1).cloned().unwrap();
        table.push(entry("x-foo", "ba2"));
        assert!(table.get_abs(1).is_none());
        assert_eq!(kept.value.chunk(), b"ba1");
    }

    #[test]
    fn test_capacity_update() {
        let mut table = HeaderTable::new(4096);
        table.push(entry("x-foo", "ba1"));
        table.push(entry("x-foo", "ba2"));
        table.update_cur_max_capacity(40);
        assert_eq!(table.len(), 1);
        assert_eq!(table.current_size(), 40);
        assert_eq!(table.cur_max_capacity(), 40);
        assert_eq!(table.max_capacity(), 4096);
    }
}
