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

use manta_common::model::{NodeId, ObjectId, ObjectLocationUpdate, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

struct OwnedObject {
    /// Local handles plus workers known to hold a reference.
    local_refs: usize,
    borrower_workers: HashSet<WorkerId>,
    /// Replica locations as reported by nodes that hold a copy.
    locations: HashSet<NodeId>,
    spilled_url: Option<String>,
    size: Option<u64>,
    /// Bumped on every location change; pollers block on the channel.
    version: watch::Sender<u64>,
}

impl OwnedObject {
    fn new() -> Self {
        OwnedObject {
            local_refs: 1,
            borrower_workers: HashSet::new(),
            locations: HashSet::new(),
            spilled_url: None,
            size: None,
            version: watch::channel(1).0,
        }
    }

    fn update(&self, object_id: ObjectId) -> ObjectLocationUpdate {
        ObjectLocationUpdate {
            object_id,
            node_ids: self.locations.iter().copied().collect(),
            spilled_url: self.spilled_url.clone(),
            size: self.size,
        }
    }
}

/// The owner side of the object lifecycle: one strong reference per object
/// this worker created, weak borrowers elsewhere, and the location set that
/// the ownership-based directory serves to subscribers.
#[derive(Default)]
pub struct ReferenceCounter {
    owned: Mutex<HashMap<ObjectId, OwnedObject>>,
}

impl ReferenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object created by this worker (a put or a return id),
    /// holding the owner's logical reference.
    pub fn add_owned_object(&self, object_id: ObjectId) {
        let mut owned = self.owned.lock().unwrap();
        owned.entry(object_id).or_insert_with(OwnedObject::new);
    }

    pub fn is_owned(&self, object_id: &ObjectId) -> bool {
        self.owned.lock().unwrap().contains_key(object_id)
    }

    pub fn add_local_reference(&self, object_id: &ObjectId) {
        let mut owned = self.owned.lock().unwrap();
        if let Some(object) = owned.get_mut(object_id) {
            object.local_refs += 1;
        }
    }

    /// Drops one local reference; returns true when the object became
    /// unreferenced and can be garbage collected by the caller.
    pub fn remove_local_reference(&self, object_id: &ObjectId) -> bool {
        let mut owned = self.owned.lock().unwrap();
        let Some(object) = owned.get_mut(object_id) else {
            return false;
        };
        object.local_refs = object.local_refs.saturating_sub(1);
        if object.local_refs == 0 && object.borrower_workers.is_empty() {
            owned.remove(object_id);
            debug!(%object_id, "owned object became unreferenced");
            true
        } else {
            false
        }
    }

    /// Another worker gained a handle to the object.
    pub fn add_borrower(&self, object_id: &ObjectId, worker_id: WorkerId) {
        let mut owned = self.owned.lock().unwrap();
        if let Some(object) = owned.get_mut(object_id) {
            object.borrower_workers.insert(worker_id);
        }
    }

    /// A borrowing worker dropped its handle; same GC contract as
    /// [`Self::remove_local_reference`].
    pub fn remove_borrower(&self, object_id: &ObjectId, worker_id: &WorkerId) -> bool {
        let mut owned = self.owned.lock().unwrap();
        let Some(object) = owned.get_mut(object_id) else {
            return false;
        };
        object.borrower_workers.remove(worker_id);
        if object.local_refs == 0 && object.borrower_workers.is_empty() {
            owned.remove(object_id);
            true
        } else {
            false
        }
    }

    /// A node reported that it holds (or stopped holding) a replica.
    pub fn update_location(&self, object_id: ObjectId, node_id: NodeId, size: Option<u64>, added: bool) {
        let mut owned = self.owned.lock().unwrap();
        let Some(object) = owned.get_mut(&object_id) else {
            return;
        };
        let changed = if added {
            object.locations.insert(node_id)
        } else {
            object.locations.remove(&node_id)
        };
        if size.is_some() {
            object.size = size;
        }
        if changed {
            object.version.send_modify(|version| *version += 1);
        }
    }

    pub fn set_spilled_url(&self, object_id: ObjectId, url: Option<String>) {
        let mut owned = self.owned.lock().unwrap();
        if let Some(object) = owned.get_mut(&object_id) {
            object.spilled_url = url;
            object.version.send_modify(|version| *version += 1);
        }
    }

    /// Long-poll endpoint of the ownership-based directory: resolves as soon
    /// as the owner's version advances past `last_version`.
    pub async fn poll_locations(
        &self,
        object_id: ObjectId,
        last_version: u64,
    ) -> Option<(u64, ObjectLocationUpdate)> {
        let mut receiver = {
            let owned = self.owned.lock().unwrap();
            let object = owned.get(&object_id)?;
            if *object.version.borrow() > last_version {
                return Some((*object.version.borrow(), object.update(object_id)));
            }
            object.version.subscribe()
        };
        let version = *receiver
            .wait_for(|version| *version > last_version)
            .await
            .ok()?;
        let owned = self.owned.lock().unwrap();
        let object = owned.get(&object_id)?;
        Some((version, object.update(object_id)))
    }

    pub fn locations(&self, object_id: &ObjectId) -> Option<ObjectLocationUpdate> {
        let owned = self.owned.lock().unwrap();
        owned.get(object_id).map(|object| object.update(*object_id))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::{JobId, TaskId};
    use std::sync::Arc;

    fn object(i: u32) -> ObjectId {
        let task =
            TaskId::for_driver(JobId::from_bytes([6, 6, 6, 6]), &WorkerId::from_bytes([6u8; 16]));
        ObjectId::for_task_return(&task, i)
    }

    #[test]
    async fn gc_happens_only_at_zero_references() {
        let counter = ReferenceCounter::new();
        counter.add_owned_object(object(0));
        counter.add_borrower(&object(0), WorkerId::from_bytes([1u8; 16]));

        // The owner's own reference goes away, the borrower still holds it.
        assert!(!counter.remove_local_reference(&object(0)));
        assert!(counter.is_owned(&object(0)));
        assert!(counter.remove_borrower(&object(0), &WorkerId::from_bytes([1u8; 16])));
        assert!(!counter.is_owned(&object(0)));
    }

    #[test]
    async fn location_polls_block_until_a_change() {
        let counter = Arc::new(ReferenceCounter::new());
        counter.add_owned_object(object(1));
        let (version, update) = counter.poll_locations(object(1), 0).await.unwrap();
        assert!(update.node_ids.is_empty());

        let poller = counter.clone();
        let pending = tokio::spawn(async move { poller.poll_locations(object(1), version).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        counter.update_location(object(1), NodeId::from_bytes([2u8; 16]), Some(64), true);
        let (new_version, update) = pending.await.unwrap().unwrap();
        assert!(new_version > version);
        assert_eq!(update.node_ids, vec![NodeId::from_bytes([2u8; 16])]);
        assert_eq!(update.size, Some(64));
    }

    #[test]
    async fn duplicate_location_reports_do_not_bump_versions() {
        let counter = ReferenceCounter::new();
        counter.add_owned_object(object(2));
        let node = NodeId::from_bytes([3u8; 16]);
        counter.update_location(object(2), node, None, true);
        let (version, _) = counter.poll_locations(object(2), 0).await.unwrap();
        counter.update_location(object(2), node, None, true);
        let (same_version, _) = counter.poll_locations(object(2), 0).await.unwrap();
        assert_eq!(version, same_version);
    }
}
