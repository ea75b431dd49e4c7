// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::collections::BTreeMap;

/// A device virtual range registered by map-buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMap {
    pub start_addr: u64,
    pub size: u64,
    pub cpu_addr: u64,
    pub is_allocated: bool,
}

impl BufferMap {
    pub fn end_addr(&self) -> u64 {
        self.start_addr.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.end_addr()
    }
}

/// Buffer mappings of one nvdec session, keyed by their device address.
///
/// Ranges are expected not to overlap. That is not enforced: lookups only
/// test the mapping with the greatest start address at or below the query.
#[derive(Debug, Default)]
pub struct BufferMapTable {
    mappings: BTreeMap<u64, BufferMap>,
}

impl BufferMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Returns the mapping containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<BufferMap> {
        self.mappings
            .range(..=addr)
            .next_back()
            .map(|(_, map)| *map)
            .filter(|map| map.contains(addr))
    }

    /// Like [`find`](Self::find), for callers that already mapped `addr`.
    ///
    /// # Panics
    ///
    /// Panics if no mapping contains `addr`.
    pub fn must_find(&self, addr: u64) -> BufferMap {
        match self.find(addr) {
            Some(map) => map,
            None => panic!("No buffer mapping contains {addr:#x}"),
        }
    }

    /// Registers a mapping at `start_addr`, replacing any mapping with the
    /// same start.
    pub fn insert_or_replace(
        &mut self,
        start_addr: u64,
        size: u64,
        cpu_addr: u64,
        is_allocated: bool,
    ) {
        self.mappings.insert(
            start_addr,
            BufferMap {
                start_addr,
                size,
                cpu_addr,
                is_allocated,
            },
        );
    }

    /// Removes the mapping starting exactly at `start_addr`.
    ///
    /// Returns `None` when there was none. Otherwise returns the size to
    /// release, which is 0 unless the range was allocated for the mapping.
    pub fn remove(&mut self, start_addr: u64) -> Option<u64> {
        self.mappings
            .remove(&start_addr)
            .map(|map| if map.is_allocated { map.size } else { 0 })
    }
}
