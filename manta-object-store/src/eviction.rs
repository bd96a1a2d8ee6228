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

use manta_common::model::ObjectId;
use std::collections::{BTreeMap, HashMap};

/// Least-recently-released index over the store's eviction candidates. Only
/// sealed objects with no outstanding references are ever inserted; anything
/// pinned again is removed before the pin is granted.
#[derive(Debug, Default)]
pub struct LruIndex {
    by_release_order: BTreeMap<u64, ObjectId>,
    positions: HashMap<ObjectId, u64>,
    next_seq: u64,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the object releasable; a re-insert refreshes its position.
    pub fn insert(&mut self, object_id: ObjectId) {
        self.remove(&object_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_release_order.insert(seq, object_id);
        self.positions.insert(object_id, seq);
    }

    pub fn remove(&mut self, object_id: &ObjectId) -> bool {
        if let Some(seq) = self.positions.remove(object_id) {
            self.by_release_order.remove(&seq);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.positions.contains_key(object_id)
    }

    /// Oldest-first victims whose cumulative size reaches `needed_bytes`.
    /// Returns fewer when the candidates run out.
    pub fn choose_victims(
        &self,
        needed_bytes: usize,
        size_of: impl Fn(&ObjectId) -> usize,
    ) -> Vec<ObjectId> {
        let mut victims = Vec::new();
        let mut freed = 0usize;
        for object_id in self.by_release_order.values() {
            if freed >= needed_bytes {
                break;
            }
            freed += size_of(object_id);
            victims.push(*object_id);
        }
        victims
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
