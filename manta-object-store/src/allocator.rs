// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use memmap2::MmapMut;
use std::collections::BTreeMap;

const ALIGNMENT: usize = 64;

/// A slice of the arena handed out to one object. Offsets are stable for the
/// lifetime of the allocation, so they can be shared as descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: usize,
    pub len: usize,
}

/// First-fit allocator over one anonymously mapped region. The region is
/// created once and never remapped, so outstanding offsets stay valid until
/// their allocation is freed.
pub struct Arena {
    map: MmapMut,
    capacity: usize,
    /// Free blocks by offset; adjacent blocks are coalesced on free.
    free: BTreeMap<usize, usize>,
    /// Live allocations by offset.
    allocated: BTreeMap<usize, usize>,
    bytes_allocated: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let map = MmapMut::map_anon(capacity)?;
        let mut free = BTreeMap::new();
        free.insert(0, capacity);
        Ok(Arena {
            map,
            capacity,
            free,
            allocated: BTreeMap::new(),
            bytes_allocated: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn allocate(&mut self, len: usize) -> Option<Allocation> {
        let rounded = round_up(len.max(1));
        let (offset, block_len) = self
            .free
            .iter()
            .find(|(_, block_len)| **block_len >= rounded)
            .map(|(offset, block_len)| (*offset, *block_len))?;

        self.free.remove(&offset);
        if block_len > rounded {
            self.free.insert(offset + rounded, block_len - rounded);
        }
        self.allocated.insert(offset, rounded);
        self.bytes_allocated += rounded;
        Some(Allocation {
            offset,
            len: rounded,
        })
    }

    /// Returns the rounded size of the freed block. Freeing an unknown
    /// offset is a caller bug.
    pub fn free(&mut self, allocation: Allocation) -> usize {
        let len = self
            .allocated
            .remove(&allocation.offset)
            .expect("freeing an offset that was never allocated");
        self.bytes_allocated -= len;

        let mut offset = allocation.offset;
        let mut merged = len;

        // Coalesce with the block that ends where this one starts.
        if let Some((prev_offset, prev_len)) = self
            .free
            .range(..offset)
            .next_back()
            .map(|(o, l)| (*o, *l))
        {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                merged += prev_len;
            }
        }
        // And with the block that starts where this one ends.
        if let Some(next_len) = self.free.get(&(allocation.offset + len)).copied() {
            self.free.remove(&(allocation.offset + len));
            merged += next_len;
        }

        self.free.insert(offset, merged);
        len
    }

    pub fn read(&self, allocation: Allocation, len: usize) -> &[u8] {
        &self.map[allocation.offset..allocation.offset + len]
    }

    pub fn write(&mut self, allocation: Allocation, at: usize, data: &[u8]) {
        debug_assert!(at + data.len() <= allocation.len);
        let start = allocation.offset + at;
        self.map[start..start + data.len()].copy_from_slice(data);
    }
}

fn round_up(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn allocations_round_trip_data() {
        let mut arena = Arena::new(4096).unwrap();
        let allocation = arena.allocate(100).unwrap();
        arena.write(allocation, 0, b"hello");
        arena.write(allocation, 5, b" world");
        assert_eq!(arena.read(allocation, 11), b"hello world");
    }

    #[test]
    fn exhaustion_returns_none_and_free_recovers() {
        let mut arena = Arena::new(1024).unwrap();
        let a = arena.allocate(512).unwrap();
        let b = arena.allocate(512).unwrap();
        assert!(arena.allocate(64).is_none());
        arena.free(a);
        assert!(arena.allocate(512).is_some());
        arena.free(b);
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let mut arena = Arena::new(4096).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| arena.allocate(1024).unwrap()).collect();
        assert!(arena.allocate(1).is_none());
        for block in blocks {
            arena.free(block);
        }
        // A full-capacity allocation only succeeds if all fragments merged.
        assert!(arena.allocate(4096).is_some());
    }

    #[test]
    fn bytes_allocated_tracks_rounding() {
        let mut arena = Arena::new(4096).unwrap();
        let a = arena.allocate(1).unwrap();
        assert_eq!(arena.bytes_allocated(), 64);
        arena.free(a);
        assert_eq!(arena.bytes_allocated(), 0);
    }
}
